//! Geplante Aufgaben eines SessionRecords
//!
//! Alle Timer einer Sitzung (Turn-Stille, Injektions-Entprellung je
//! Modalitaet) liegen in einem `TimerSet`. Abbau der Sitzung bricht alle
//! in einem Durchgang ab; `Drop` tut dasselbe.
//!
//! Ein feuernder Timer meldet sich mit seiner ID zurueck
//! ([`TimerSet::abgelaufen`]). Wurde der Slot inzwischen neu belegt, ist
//! der alte Timer veraltet und darf nichts mehr tun.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use livegate_core::Modalitaet;
use tokio::task::AbortHandle;

/// Globaler Zaehler fuer Timer-IDs
static TIMER_ZAEHLER: AtomicU64 = AtomicU64::new(1);

/// Slot-Art
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerArt {
    /// Stille-Timer des Turn-Detektors
    Turn,
    /// Entprellung der Kontext-Injektion
    Injektion(Modalitaet),
}

#[derive(Debug)]
struct TimerSlot {
    id: u64,
    handle: AbortHandle,
}

/// Alle laufenden Timer einer Sitzung
#[derive(Debug, Default)]
pub struct TimerSet {
    slots: HashMap<TimerArt, TimerSlot>,
}

impl TimerSet {
    pub fn neu() -> Self {
        Self::default()
    }

    /// Reserviert eine ID fuer einen neuen Timer
    pub fn naechste_id() -> u64 {
        TIMER_ZAEHLER.fetch_add(1, Ordering::Relaxed)
    }

    /// Belegt einen Slot; ein dort laufender Timer wird abgebrochen
    pub fn setzen(&mut self, art: TimerArt, id: u64, handle: AbortHandle) {
        if let Some(alt) = self.slots.insert(art, TimerSlot { id, handle }) {
            alt.handle.abort();
        }
    }

    /// Bricht den Timer eines Slots ab. `true` wenn einer lief.
    pub fn abbrechen(&mut self, art: TimerArt) -> bool {
        match self.slots.remove(&art) {
            Some(slot) => {
                slot.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Vom feuernden Timer aufgerufen: gibt den Slot frei, falls er noch
    /// diesem Timer gehoert.
    pub fn abgelaufen(&mut self, art: TimerArt, id: u64) -> bool {
        match self.slots.get(&art) {
            Some(slot) if slot.id == id => {
                self.slots.remove(&art);
                true
            }
            _ => false,
        }
    }

    pub fn aktiv(&self, art: TimerArt) -> bool {
        self.slots.contains_key(&art)
    }

    /// Bricht alle Timer ab und gibt die Anzahl zurueck
    pub fn alle_abbrechen(&mut self) -> usize {
        let anzahl = self.slots.len();
        for (_, slot) in self.slots.drain() {
            slot.handle.abort();
        }
        anzahl
    }

    pub fn anzahl(&self) -> usize {
        self.slots.len()
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.alle_abbrechen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    fn schlafender_task() -> JoinHandle<()> {
        tokio::spawn(tokio::time::sleep(Duration::from_secs(3600)))
    }

    async fn wurde_abgebrochen(handle: JoinHandle<()>) -> bool {
        matches!(handle.await, Err(e) if e.is_cancelled())
    }

    #[tokio::test]
    async fn setzen_bricht_alten_timer_ab() {
        let mut timer = TimerSet::neu();
        let alt = schlafender_task();
        timer.setzen(TimerArt::Turn, TimerSet::naechste_id(), alt.abort_handle());
        timer.setzen(
            TimerArt::Turn,
            TimerSet::naechste_id(),
            schlafender_task().abort_handle(),
        );

        assert!(wurde_abgebrochen(alt).await);
        assert_eq!(timer.anzahl(), 1);
    }

    #[tokio::test]
    async fn veralteter_timer_gibt_slot_nicht_frei() {
        let mut timer = TimerSet::neu();
        let erste = TimerSet::naechste_id();
        let zweite = TimerSet::naechste_id();
        timer.setzen(TimerArt::Turn, erste, schlafender_task().abort_handle());
        timer.setzen(TimerArt::Turn, zweite, schlafender_task().abort_handle());

        assert!(!timer.abgelaufen(TimerArt::Turn, erste));
        assert!(timer.aktiv(TimerArt::Turn));
        assert!(timer.abgelaufen(TimerArt::Turn, zweite));
        assert!(!timer.aktiv(TimerArt::Turn));
    }

    #[tokio::test]
    async fn alle_abbrechen_leert_jeden_slot() {
        let mut timer = TimerSet::neu();
        let turn = schlafender_task();
        let screen = schlafender_task();
        let webcam = schlafender_task();
        timer.setzen(TimerArt::Turn, TimerSet::naechste_id(), turn.abort_handle());
        timer.setzen(
            TimerArt::Injektion(Modalitaet::Screen),
            TimerSet::naechste_id(),
            screen.abort_handle(),
        );
        timer.setzen(
            TimerArt::Injektion(Modalitaet::Webcam),
            TimerSet::naechste_id(),
            webcam.abort_handle(),
        );

        assert_eq!(timer.alle_abbrechen(), 3);
        assert_eq!(timer.anzahl(), 0);
        for handle in [turn, screen, webcam] {
            assert!(wurde_abgebrochen(handle).await);
        }
    }

    #[tokio::test]
    async fn drop_bricht_ab() {
        let handle = schlafender_task();
        {
            let mut timer = TimerSet::neu();
            timer.setzen(TimerArt::Turn, TimerSet::naechste_id(), handle.abort_handle());
        }
        assert!(wurde_abgebrochen(handle).await);
    }
}
