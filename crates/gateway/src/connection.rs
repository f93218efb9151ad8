//! Verbindungs-Verwaltung: Anlegen und Abbauen des Verbindungszustands

use std::sync::Arc;

use livegate_core::ConnectionId;
use livegate_protocol::ServerMessage;
use serde_json::json;

use crate::outbound::{ClientEmpfaenger, ClientSender};
use crate::registry::ConnectionState;
use crate::session;
use crate::session_log::SitzungsLogger;
use crate::state::GatewayState;

/// Registriert eine neue Verbindung und sendet `connected`
///
/// Schlaegt nie fehl. Das Sitzungs-Log wird im Hintergrund geoeffnet und
/// nachgereicht, sobald die Datei bereit ist.
pub fn initialisieren(state: &Arc<GatewayState>) -> (ConnectionId, ClientEmpfaenger) {
    let id = ConnectionId::new();
    let (sender, empfaenger) = ClientSender::kanal(id);

    state
        .registry
        .verbindung_einfuegen(ConnectionState::neu(id, Some(sender)));
    state.last_aktualisieren();

    state.registry.senden(
        id,
        ServerMessage::Connected {
            connection_id: id.inner().to_string(),
        },
    );

    if let Some(verzeichnis) = state.config.sitzungs_verzeichnis.clone() {
        let state = Arc::clone(state);
        tokio::spawn(async move {
            match SitzungsLogger::oeffnen(&verzeichnis, id).await {
                Ok(logger) => {
                    logger.schreiben("verbunden", json!({ "connection_id": id.inner().to_string() }));
                    let angehaengt = state.registry.mit_verbindung(id, |s| s.logger = Some(logger));
                    if angehaengt.is_none() {
                        tracing::debug!(connection_id = %id, "Verbindung vor dem Sitzungs-Log beendet");
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        connection_id = %id,
                        verzeichnis = %verzeichnis.display(),
                        fehler = %e,
                        "Sitzungs-Log konnte nicht geoeffnet werden"
                    );
                }
            }
        });
    }

    tracing::info!(connection_id = %id, verbindungen = state.registry.verbindungen_anzahl(), "Client verbunden");
    (id, empfaenger)
}

/// Baut alles ab, was zur Verbindung gehoert
///
/// Timer werden vor dem Entfernen der Eintraege abgebrochen, damit keiner
/// mehr in freigegebenen Zustand feuert.
pub async fn aufraeumen(
    state: &Arc<GatewayState>,
    id: ConnectionId,
    close_code: Option<u16>,
    grund: &str,
) {
    let timer = state
        .registry
        .mit_sitzung(id, |r| r.timer.alle_abbrechen())
        .unwrap_or(0);

    let verbindung = state.registry.verbindung_entfernen(id);
    if let Some(ref verbindung) = verbindung {
        verbindung.abbruch.cancel();
        if let Some(logger) = &verbindung.logger {
            logger.schreiben("getrennt", json!({ "code": close_code, "grund": grund }));
        }
    }

    if let Some(record) = state.registry.sitzung_entfernen(id) {
        session::sitzung_schliessen(state, id, record, "verbindung_getrennt", false).await;
    }
    state.last_aktualisieren();

    tracing::info!(
        connection_id = %id,
        code = ?close_code,
        grund,
        abgebrochene_timer = timer,
        bekannt = verbindung.is_some(),
        "Client getrennt"
    );
}
