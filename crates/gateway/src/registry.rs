//! Registry – der einzige geteilte, veraenderliche Zustand des Gateways
//!
//! Zwei DashMaps, beide per `ConnectionId` adressiert:
//! - `ConnectionState`: einer pro offener Verbindung
//! - `SessionRecord`: hoechstens einer pro Verbindung, bei Restart ersetzt
//!
//! Zugriff nur ueber Closures (`mit_verbindung`, `mit_sitzung`). So kann
//! kein Guard ueber einen `.await` hinweg gehalten werden: wer nach einer
//! Suspension weiterarbeitet, liest den aktuellen Eintrag neu.
//! Closures einer Map duerfen die andere Map nicht anfassen.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use livegate_core::{ConnectionId, Modalitaet, SessionId};
use livegate_observability::LastQuelle;
use livegate_protocol::ServerMessage;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::outbound::{Ausgehend, ClientSender};
use crate::rate_limit::RateLimitWindow;
use crate::session_log::SitzungsLogger;
use crate::timers::TimerSet;
use crate::upstream::UpstreamSession;

/// Globaler Zaehler fuer Sitzungs-Epochen
static EPOCHEN_ZAEHLER: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// ConnectionState
// ---------------------------------------------------------------------------

/// Phase einer Verbindung
///
/// ```text
/// Verbunden -> (start) -> Startet -> Offen -> Bereit -> (stop|close|error) -> Geschlossen
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Verbunden,
    /// Verbindungsaufbau zum Upstream laeuft; weitere `start` werden ignoriert
    Startet,
    /// Upstream offen, Setup noch nicht bestaetigt
    Offen,
    Bereit,
    Geschlossen,
}

/// Zustand einer offenen Client-Verbindung
#[derive(Debug)]
pub struct ConnectionState {
    pub connection_id: ConnectionId,
    pub is_ready: bool,
    pub phase: Phase,
    /// Zaehlt angenommene `start` und `stop`
    pub start_generation: u64,
    /// Letzte Heartbeat-Aktivitaet (ping, pong, heartbeat_ack)
    pub last_ping: Instant,
    pub allgemein: RateLimitWindow,
    pub audio: RateLimitWindow,
    pub medien: RateLimitWindow,
    /// Ergebnis der Admin-Pruefung beim letzten `start`
    pub privilegiert: bool,
    pub sender: Option<ClientSender>,
    /// Wird beim Abbau oder vom Heartbeat-Sweep ausgeloest
    pub abbruch: CancellationToken,
    /// Wird asynchron nachgereicht
    pub logger: Option<SitzungsLogger>,
}

impl ConnectionState {
    pub fn neu(connection_id: ConnectionId, sender: Option<ClientSender>) -> Self {
        let jetzt = Instant::now();
        Self {
            connection_id,
            is_ready: false,
            phase: Phase::Verbunden,
            start_generation: 0,
            last_ping: jetzt,
            allgemein: RateLimitWindow::neu(jetzt),
            audio: RateLimitWindow::neu(jetzt),
            medien: RateLimitWindow::neu(jetzt),
            privilegiert: false,
            sender,
            abbruch: CancellationToken::new(),
            logger: None,
        }
    }
}

// ---------------------------------------------------------------------------
// SessionRecord
// ---------------------------------------------------------------------------

/// Letzte visuelle Aufnahme einer Modalitaet
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub analysis: String,
    /// Unix-Millisekunden laut Client
    pub captured_at: Option<i64>,
    /// Base64-JPEG
    pub image_data: Option<String>,
    pub empfangen: Instant,
    pub last_injected: Option<Instant>,
    pub last_persisted: Option<Instant>,
}

impl Snapshot {
    pub fn neu(jetzt: Instant) -> Self {
        Self {
            analysis: String::new(),
            captured_at: None,
            image_data: None,
            empfangen: jetzt,
            last_injected: None,
            last_persisted: None,
        }
    }
}

/// Eine Upstream-Sitzung einer Verbindung
pub struct SessionRecord {
    pub session_id: SessionId,
    /// Eindeutig pro Sitzung; Ereignisse einer ersetzten Sitzung werden verworfen
    pub epoche: u64,
    pub upstream: Arc<dyn UpstreamSession>,
    pub snapshots: HashMap<Modalitaet, Snapshot>,
    pub timer: TimerSet,
    pub audio_chunk_count: u64,
    pub user_turn_count: u64,
    /// Finale Transkripte, die noch nicht synchronisiert wurden
    pub letzte_nutzer_aeusserung: Option<String>,
    pub letzte_assistent_aeusserung: Option<String>,
    pub sync_laeuft: bool,
    pub letzter_sync_turn: Option<u64>,
    pub setup_abgeschlossen: bool,
    pub gestartet: Instant,
}

impl SessionRecord {
    pub fn neu(session_id: SessionId, upstream: Arc<dyn UpstreamSession>) -> Self {
        Self {
            session_id,
            epoche: EPOCHEN_ZAEHLER.fetch_add(1, Ordering::Relaxed),
            upstream,
            snapshots: HashMap::new(),
            timer: TimerSet::neu(),
            audio_chunk_count: 0,
            user_turn_count: 0,
            letzte_nutzer_aeusserung: None,
            letzte_assistent_aeusserung: None,
            sync_laeuft: false,
            letzter_sync_turn: None,
            setup_abgeschlossen: false,
            gestartet: Instant::now(),
        }
    }
}

impl std::fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRecord")
            .field("session_id", &self.session_id)
            .field("epoche", &self.epoche)
            .field("audio_chunk_count", &self.audio_chunk_count)
            .field("user_turn_count", &self.user_turn_count)
            .field("timer", &self.timer.anzahl())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Verbindungs- und Sitzungs-Registry
#[derive(Default)]
pub struct Registry {
    verbindungen: DashMap<ConnectionId, ConnectionState>,
    sitzungen: DashMap<ConnectionId, SessionRecord>,
}

impl Registry {
    pub fn neu() -> Self {
        Self::default()
    }

    // --- Verbindungen ---

    pub fn verbindung_einfuegen(&self, state: ConnectionState) {
        self.verbindungen.insert(state.connection_id, state);
    }

    pub fn verbindung_entfernen(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.verbindungen.remove(&id).map(|(_, state)| state)
    }

    pub fn hat_verbindung(&self, id: ConnectionId) -> bool {
        self.verbindungen.contains_key(&id)
    }

    /// Fuehrt `f` auf dem Zustand aus, falls vorhanden
    pub fn mit_verbindung<R>(
        &self,
        id: ConnectionId,
        f: impl FnOnce(&mut ConnectionState) -> R,
    ) -> Option<R> {
        self.verbindungen.get_mut(&id).map(|mut eintrag| f(&mut eintrag))
    }

    /// Wie `mit_verbindung`, legt fehlenden Zustand aber neu an
    ///
    /// Fehlender Zustand bedeutet einen kaputten Lebenszyklus und wird als
    /// Fehler geloggt. Die Verarbeitung laeuft trotzdem weiter.
    pub fn mit_verbindung_oder_standard<R>(
        &self,
        id: ConnectionId,
        f: impl FnOnce(&mut ConnectionState) -> R,
    ) -> R {
        let mut eintrag = self.verbindungen.entry(id).or_insert_with(|| {
            tracing::error!(
                connection_id = %id,
                "ConnectionState fehlt – Lebenszyklus defekt, lege Standardzustand an"
            );
            ConnectionState::neu(id, None)
        });
        f(&mut eintrag)
    }

    pub fn ist_bereit(&self, id: ConnectionId) -> bool {
        self.mit_verbindung(id, |s| s.is_ready).unwrap_or(false)
    }

    pub fn sender(&self, id: ConnectionId) -> Option<ClientSender> {
        self.mit_verbindung(id, |s| s.sender.clone()).flatten()
    }

    /// Sendet einen Frame an die Verbindung (normale Spur)
    pub fn senden(&self, id: ConnectionId, nachricht: ServerMessage) -> bool {
        match self.sender(id) {
            Some(sender) => sender.senden(nachricht),
            None => {
                tracing::debug!(
                    connection_id = %id,
                    nachricht = nachricht.typ(),
                    "Senden an unbekannte Verbindung"
                );
                false
            }
        }
    }

    /// Sendet an der normalen Queue vorbei
    pub fn prioritaet_senden(&self, id: ConnectionId, ausgehend: Ausgehend) -> bool {
        self.sender(id)
            .map(|sender| sender.prioritaet_senden(ausgehend))
            .unwrap_or(false)
    }

    /// Vermerkt Heartbeat-Aktivitaet
    pub fn heartbeat_registrieren(&self, id: ConnectionId) {
        self.mit_verbindung(id, |s| s.last_ping = Instant::now());
    }

    /// Schreibt ein Ereignis in das Sitzungs-Log der Verbindung (falls offen)
    pub fn protokollieren(&self, id: ConnectionId, ereignis: &str, details: Value) {
        if let Some(logger) = self.mit_verbindung(id, |s| s.logger.clone()).flatten() {
            logger.schreiben(ereignis, details);
        }
    }

    pub fn verbindungs_ids(&self) -> Vec<ConnectionId> {
        self.verbindungen.iter().map(|e| *e.key()).collect()
    }

    // --- Sitzungen ---

    /// Fuegt einen SessionRecord ein und gibt einen ersetzten zurueck
    pub fn sitzung_einfuegen(&self, id: ConnectionId, record: SessionRecord) -> Option<SessionRecord> {
        self.sitzungen.insert(id, record)
    }

    pub fn sitzung_entfernen(&self, id: ConnectionId) -> Option<SessionRecord> {
        self.sitzungen.remove(&id).map(|(_, record)| record)
    }

    /// Entfernt den Record nur, wenn er noch zur gegebenen Epoche gehoert
    pub fn sitzung_entfernen_wenn(&self, id: ConnectionId, epoche: u64) -> Option<SessionRecord> {
        self.sitzungen
            .remove_if(&id, |_, record| record.epoche == epoche)
            .map(|(_, record)| record)
    }

    pub fn hat_sitzung(&self, id: ConnectionId) -> bool {
        self.sitzungen.contains_key(&id)
    }

    pub fn mit_sitzung<R>(
        &self,
        id: ConnectionId,
        f: impl FnOnce(&mut SessionRecord) -> R,
    ) -> Option<R> {
        self.sitzungen.get_mut(&id).map(|mut eintrag| f(&mut eintrag))
    }

    /// Wie `mit_sitzung`, aber nur fuer die gegebene Epoche
    pub fn mit_sitzung_der_epoche<R>(
        &self,
        id: ConnectionId,
        epoche: u64,
        f: impl FnOnce(&mut SessionRecord) -> R,
    ) -> Option<R> {
        self.sitzungen
            .get_mut(&id)
            .filter(|eintrag| eintrag.epoche == epoche)
            .map(|mut eintrag| f(&mut eintrag))
    }

    /// Ist die Sitzung dieser Epoche noch die aktuelle?
    pub fn ist_aktuell(&self, id: ConnectionId, epoche: u64) -> bool {
        self.mit_sitzung(id, |r| r.epoche == epoche).unwrap_or(false)
    }

    pub fn upstream(&self, id: ConnectionId) -> Option<Arc<dyn UpstreamSession>> {
        self.mit_sitzung(id, |r| Arc::clone(&r.upstream))
    }

    pub fn verbindungen_anzahl(&self) -> usize {
        self.verbindungen.len()
    }

    pub fn sitzungen_anzahl(&self) -> usize {
        self.sitzungen.len()
    }
}

impl LastQuelle for Registry {
    fn aktive_verbindungen(&self) -> usize {
        self.verbindungen_anzahl()
    }

    fn aktive_sitzungen(&self) -> usize {
        self.sitzungen_anzahl()
    }
}
