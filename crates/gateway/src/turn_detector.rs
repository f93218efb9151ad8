//! Turn-Erkennung per Stille
//!
//! Das Turn-Ende des Upstreams kommt nicht immer oder zu spaet. Jeder
//! weitergeleitete Audio-Chunk startet daher einen Stille-Timer neu; laeuft er
//! ab, bevor das native `turn_complete` eintrifft, geht ein synthetisches
//! `turn_complete` mit Grund `timeout_silence` an den Client.

use std::sync::Arc;
use std::time::Duration;

use livegate_core::ConnectionId;
use livegate_observability::GatewayMetrics;
use livegate_protocol::{ServerMessage, TurnGrund};
use serde_json::json;

use crate::registry::Registry;
use crate::timers::{TimerArt, TimerSet};

/// Standard-Stille bis zum synthetischen Turn-Ende
pub const STANDARD_STILLE: Duration = Duration::from_millis(3000);

pub struct TurnDetector {
    registry: Arc<Registry>,
    stille: Duration,
    metriken: GatewayMetrics,
}

impl TurnDetector {
    pub fn neu(registry: Arc<Registry>, stille: Duration, metriken: GatewayMetrics) -> Self {
        Self {
            registry,
            stille,
            metriken,
        }
    }

    /// Startet den Stille-Timer der Sitzung (neu). Ohne Sitzung passiert nichts.
    pub fn zuruecksetzen(&self, id: ConnectionId) {
        let timer_id = TimerSet::naechste_id();
        let registry = Arc::clone(&self.registry);
        let metriken = self.metriken.clone();
        let stille = self.stille;

        self.registry.mit_sitzung(id, move |record| {
            let epoche = record.epoche;
            let task = tokio::spawn(async move {
                tokio::time::sleep(stille).await;

                let faellig = registry
                    .mit_sitzung_der_epoche(id, epoche, |r| r.timer.abgelaufen(TimerArt::Turn, timer_id))
                    .unwrap_or(false);
                if !faellig {
                    return;
                }

                registry.senden(id, ServerMessage::turn_complete(TurnGrund::TimeoutSilence));
                metriken.synthetic_turns_total.inc();
                registry.protokollieren(
                    id,
                    "turn_complete",
                    json!({ "reason": "timeout_silence", "stille_ms": stille.as_millis() as u64 }),
                );
                tracing::info!(connection_id = %id, grund = "timeout_silence", "Synthetisches Turn-Ende gesendet");
            });
            record.timer.setzen(TimerArt::Turn, timer_id, task.abort_handle());
        });
    }

    /// Natives Turn-Ende: laufenden Stille-Timer verwerfen
    pub fn abbrechen(&self, id: ConnectionId) -> bool {
        self.registry
            .mit_sitzung(id, |record| record.timer.abbrechen(TimerArt::Turn))
            .unwrap_or(false)
    }

    pub fn stille(&self) -> Duration {
        self.stille
    }
}
