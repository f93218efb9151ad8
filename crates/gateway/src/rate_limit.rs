//! Rate Limiter fuer eingehende Frames
//!
//! Festes Fenster pro Verbindung und Klasse (kein gleitendes Fenster):
//! an Fenstergrenzen sind kurze Bursts bis zum doppelten Nennwert moeglich.
//! Aufrufer verlassen sich auf diese Toleranz.
//!
//! | Klasse    | Budget                            |
//! |-----------|-----------------------------------|
//! | Allgemein | 100/min (500/min privilegiert)    |
//! | Audio     | 200/s                             |
//! | Medien    | 300/min                           |

use std::sync::Arc;
use std::time::Duration;

use livegate_core::ConnectionId;
use tokio::time::Instant;

use crate::registry::{ConnectionState, Registry};

/// Konfiguration fuer den Rate Limiter
#[derive(Debug, Clone)]
pub struct RateLimitKonfig {
    pub allgemein_pro_minute: u32,
    /// Budget fuer privilegierte Aufrufer (Admin-Sitzungen)
    pub allgemein_admin_pro_minute: u32,
    pub audio_pro_sekunde: u32,
    pub medien_pro_minute: u32,
}

impl Default for RateLimitKonfig {
    fn default() -> Self {
        Self {
            allgemein_pro_minute: 100,
            allgemein_admin_pro_minute: 500,
            audio_pro_sekunde: 200,
            medien_pro_minute: 300,
        }
    }
}

/// Nachrichtenklasse mit eigenem Budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKlasse {
    Allgemein,
    Audio,
    Medien,
}

impl LimitKlasse {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Allgemein => "allgemein",
            Self::Audio => "audio",
            Self::Medien => "medien",
        }
    }
}

// ---------------------------------------------------------------------------
// RateLimitWindow
// ---------------------------------------------------------------------------

/// Fester Zaehler `(count, start)` einer Klasse
#[derive(Debug, Clone)]
pub struct RateLimitWindow {
    pub count: u32,
    pub start: Instant,
}

impl RateLimitWindow {
    pub fn neu(jetzt: Instant) -> Self {
        Self {
            count: 0,
            start: jetzt,
        }
    }

    /// Zaehlt einen Aufruf. `Err(restsekunden)` wenn das Budget erschoepft ist.
    pub fn pruefen(&mut self, jetzt: Instant, fenster: Duration, max: u32) -> Result<(), u64> {
        let vergangen = jetzt.saturating_duration_since(self.start);
        if vergangen >= fenster {
            self.count = 1;
            self.start = jetzt;
            return Ok(());
        }
        if self.count < max {
            self.count += 1;
            return Ok(());
        }
        let rest = fenster - vergangen;
        Err((rest.as_secs_f64().ceil() as u64).max(1))
    }
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// Prueft Budgets gegen die Fenster im `ConnectionState`
pub struct RateLimiter {
    konfig: RateLimitKonfig,
    registry: Arc<Registry>,
}

impl RateLimiter {
    pub fn neu(konfig: RateLimitKonfig, registry: Arc<Registry>) -> Self {
        Self { konfig, registry }
    }

    /// Prueft und verbraucht ein Budget-Element.
    ///
    /// Gibt `Ok(())` zurueck wenn erlaubt, `Err(retry_after_secs)` sonst.
    pub fn pruefen(&self, id: ConnectionId, klasse: LimitKlasse) -> Result<(), u64> {
        self.pruefen_zum(id, klasse, Instant::now())
    }

    /// Wie [`pruefen`](Self::pruefen), mit explizitem Zeitpunkt
    pub fn pruefen_zum(
        &self,
        id: ConnectionId,
        klasse: LimitKlasse,
        jetzt: Instant,
    ) -> Result<(), u64> {
        // Fehlender Zustand wird in der Registry geloggt und ersetzt
        self.registry
            .mit_verbindung_oder_standard(id, |state| self.fenster_pruefen(state, klasse, jetzt))
    }

    fn fenster_pruefen(
        &self,
        state: &mut ConnectionState,
        klasse: LimitKlasse,
        jetzt: Instant,
    ) -> Result<(), u64> {
        match klasse {
            LimitKlasse::Allgemein => {
                let max = if state.privilegiert {
                    self.konfig.allgemein_admin_pro_minute
                } else {
                    self.konfig.allgemein_pro_minute
                };
                state.allgemein.pruefen(jetzt, Duration::from_secs(60), max)
            }
            LimitKlasse::Audio => {
                state
                    .audio
                    .pruefen(jetzt, Duration::from_secs(1), self.konfig.audio_pro_sekunde)
            }
            LimitKlasse::Medien => {
                state
                    .medien
                    .pruefen(jetzt, Duration::from_secs(60), self.konfig.medien_pro_minute)
            }
        }
    }
}
