//! Globaler Heartbeat-Sweep
//!
//! Alle `intervall` wird jede Verbindung geprueft: ohne Aktivitaet seit
//! `timeout` wird sie ueber ihr Abbruch-Token beendet, sonst bekommt sie
//! einen WebSocket-Ping auf der Prioritaetsspur.

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::outbound::Ausgehend;
use crate::state::GatewayState;

/// Ergebnis eines Durchlaufs
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepErgebnis {
    pub gepingt: usize,
    pub beendet: usize,
}

/// Ein Durchlauf ueber alle Verbindungen
pub fn durchlauf(state: &GatewayState) -> SweepErgebnis {
    let jetzt = Instant::now();
    let timeout = state.config.heartbeat_timeout;
    let mut ergebnis = SweepErgebnis::default();

    for id in state.registry.verbindungs_ids() {
        let abgelaufen = state.registry.mit_verbindung(id, |s| {
            let still = jetzt.saturating_duration_since(s.last_ping);
            if still > timeout {
                s.abbruch.cancel();
                Some(still)
            } else {
                None
            }
        });

        match abgelaufen {
            Some(Some(still)) => {
                ergebnis.beendet += 1;
                tracing::warn!(
                    connection_id = %id,
                    still_sek = still.as_secs(),
                    "Heartbeat-Timeout – Verbindung wird beendet"
                );
            }
            Some(None) => {
                if state.registry.prioritaet_senden(id, Ausgehend::Ping) {
                    ergebnis.gepingt += 1;
                }
            }
            None => {}
        }
    }
    ergebnis
}

/// Sweep-Schleife bis zum Shutdown
pub async fn sweep_schleife(state: Arc<GatewayState>, shutdown: CancellationToken) {
    let mut intervall = tokio::time::interval(state.config.heartbeat_intervall);
    intervall.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Der erste Tick kommt sofort
    intervall.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!("Heartbeat-Sweep beendet");
                break;
            }
            _ = intervall.tick() => {
                let ergebnis = durchlauf(&state);
                tracing::trace!(gepingt = ergebnis.gepingt, beendet = ergebnis.beendet, "Heartbeat-Sweep");
            }
        }
    }
}
