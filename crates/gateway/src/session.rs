//! Sitzungs-Lebenszyklus
//!
//! ```text
//! start -> Startet --connect--> Offen --setupComplete--> Bereit
//!            |                    |                        |
//!            +-- Fehler/Timeout --+---- error/closed ------+--> Geschlossen
//! ```
//!
//! `start` wird sofort bestaetigt, der Verbindungsaufbau laeuft in einem
//! eigenen Task. Dieser Task arbeitet danach die Upstream-Ereignisse in einer
//! einzigen Schleife ab. Jede Sitzung hat eine Epoche; Ereignisse und Timer
//! einer ersetzten Sitzung werden verworfen.

use std::sync::Arc;

use livegate_core::{ConnectionId, SessionId};
use livegate_protocol::{ServerMessage, StartPayload, ToolCallPayload, TranscriptPayload, TurnGrund};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::collaborators::{Sprecher, TurnNachricht};
use crate::error::{FehlerKategorie, GatewayError, GatewayResult};
use crate::registry::{Phase, SessionRecord};
use crate::state::GatewayState;
use crate::upstream::{FunctionCall, SessionConfig, TranskriptRichtung, UpstreamEvent};

// ---------------------------------------------------------------------------
// start / stop
// ---------------------------------------------------------------------------

/// Behandelt `start`: bestaetigt sofort und baut die Sitzung im Hintergrund auf
///
/// Ein `start` waehrend ein anderer laeuft wird ignoriert. Jeder
/// angenommene `start` und jeder `stop` erhoeht die Start-Generation; ein
/// Aufbau, dessen Generation nicht mehr aktuell ist, verwirft sein Ergebnis.
pub async fn starten(
    state: &Arc<GatewayState>,
    id: ConnectionId,
    payload: StartPayload,
) -> GatewayResult<()> {
    let darf_starten = state.registry.mit_verbindung(id, |s| {
        if s.phase == Phase::Startet {
            return None;
        }
        s.phase = Phase::Startet;
        s.is_ready = false;
        s.start_generation += 1;
        Some(s.start_generation)
    });

    let generation = match darf_starten {
        Some(Some(generation)) => generation,
        Some(None) => {
            tracing::info!(connection_id = %id, "start ignoriert – Sitzungsaufbau laeuft bereits");
            return Ok(());
        }
        None => {
            tracing::error!(connection_id = %id, "start fuer unbekannte Verbindung");
            return Err(GatewayError::intern("Verbindung nicht registriert"));
        }
    };

    let session_id = SessionId::neu(payload.session_id.clone().unwrap_or_default());
    state.registry.senden(
        id,
        ServerMessage::StartAck {
            session_id: session_id.to_string(),
        },
    );
    state
        .registry
        .protokollieren(id, "start", json!({ "session_id": session_id.as_str() }));

    let span = tracing::info_span!("sitzung", connection_id = %id, session_id = %session_id);
    let state = Arc::clone(state);
    tokio::spawn(
        async move {
            verbindungsaufbau(state, id, generation, session_id, payload).await;
        }
        .instrument(span),
    );
    Ok(())
}

/// Behandelt `stop`
pub async fn stoppen(state: &Arc<GatewayState>, id: ConnectionId) -> GatewayResult<()> {
    state.registry.mit_verbindung(id, |s| {
        s.is_ready = false;
        s.phase = Phase::Geschlossen;
        s.start_generation += 1;
    });

    match state.registry.sitzung_entfernen(id) {
        Some(record) => sitzung_schliessen(state, id, record, "client_stop", true).await,
        None => {
            tracing::debug!(connection_id = %id, "stop ohne aktive Sitzung");
            state.registry.senden(
                id,
                ServerMessage::SessionClosed {
                    reason: "client_stop".to_string(),
                },
            );
        }
    }
    Ok(())
}

/// Baut einen bereits aus der Registry entfernten Record ab
///
/// Bricht alle Timer ab und schliesst den Upstream. `benachrichtigen`
/// steuert das `session_closed` an den Client (nicht bei Restart oder
/// getrennter Verbindung).
pub async fn sitzung_schliessen(
    state: &Arc<GatewayState>,
    id: ConnectionId,
    mut record: SessionRecord,
    grund: &str,
    benachrichtigen: bool,
) {
    let timer = record.timer.alle_abbrechen();
    record.upstream.close().await;
    state.last_aktualisieren();

    let dauer = record.gestartet.elapsed();
    state.metriken.session_duration_seconds.observe(dauer.as_secs_f64());
    state.registry.protokollieren(
        id,
        "sitzung_beendet",
        json!({
            "grund": grund,
            "dauer_sek": dauer.as_secs(),
            "audio_chunks": record.audio_chunk_count,
            "nutzer_turns": record.user_turn_count,
        }),
    );
    tracing::info!(
        connection_id = %id,
        session_id = %record.session_id,
        grund,
        dauer_sek = dauer.as_secs(),
        audio_chunks = record.audio_chunk_count,
        nutzer_turns = record.user_turn_count,
        abgebrochene_timer = timer,
        "Sitzung beendet"
    );

    if benachrichtigen {
        state.registry.senden(
            id,
            ServerMessage::SessionClosed {
                reason: grund.to_string(),
            },
        );
    }
}

// ---------------------------------------------------------------------------
// Verbindungsaufbau
// ---------------------------------------------------------------------------

/// Gehoert der Aufbau mit dieser Generation noch zum aktuellen `start`?
fn noch_gewollt(state: &GatewayState, id: ConnectionId, generation: u64) -> bool {
    state
        .registry
        .mit_verbindung(id, |s| s.phase == Phase::Startet && s.start_generation == generation)
        .unwrap_or(false)
}

async fn verbindungsaufbau(
    state: Arc<GatewayState>,
    id: ConnectionId,
    generation: u64,
    session_id: SessionId,
    payload: StartPayload,
) {
    match aufbauen(&state, id, generation, &session_id, &payload).await {
        Ok(Some((epoche, ereignisse))) => {
            ereignisschleife(state, id, epoche, session_id, ereignisse).await;
        }
        Ok(None) => {}
        Err(fehler) => {
            if let GatewayError::Upstream { kategorie, .. } = &fehler {
                state
                    .metriken
                    .upstream_errors_total
                    .with_label_values(&[kategorie.label()])
                    .inc();
            }

            // Erneuter start bleibt moeglich
            let aktuell = state
                .registry
                .mit_verbindung(id, |s| {
                    let aktuell = s.start_generation == generation;
                    if aktuell && s.phase == Phase::Startet {
                        s.phase = Phase::Verbunden;
                    }
                    aktuell
                })
                .unwrap_or(false);
            if !aktuell {
                tracing::info!(connection_id = %id, fehler = %fehler, "Fehler eines ueberholten Sitzungsstarts verworfen");
                return;
            }
            tracing::warn!(connection_id = %id, fehler = %fehler, "Sitzungsstart fehlgeschlagen");
            state.registry.protokollieren(
                id,
                "start_fehlgeschlagen",
                json!({ "code": fehler.code().as_str(), "fehler": fehler.to_string() }),
            );
            state.registry.senden(id, fehler.als_nachricht());
        }
    }
}

/// `Ok(None)`: Verbindung waehrend des Aufbaus verschwunden oder gestoppt
async fn aufbauen(
    state: &Arc<GatewayState>,
    id: ConnectionId,
    generation: u64,
    session_id: &SessionId,
    payload: &StartPayload,
) -> GatewayResult<Option<(u64, mpsc::Receiver<UpstreamEvent>)>> {
    // Restart: alte Sitzung ohne Benachrichtigung abbauen
    if let Some(alt) = state.registry.sitzung_entfernen(id) {
        tracing::info!(connection_id = %id, alte_sitzung = %alt.session_id, "Restart – schliesse bisherige Sitzung");
        sitzung_schliessen(state, id, alt, "restart", false).await;
    }

    let privilegiert = state.kollaborateure.admin.ist_admin(session_id).await;
    state.registry.mit_verbindung(id, |s| s.privilegiert = privilegiert);

    let config = sitzungs_config(state, session_id, payload).await?;
    let timeout = state.config.upstream.verbindungs_timeout;

    tracing::debug!(
        connection_id = %id,
        modell = %config.modell,
        sprache = %config.sprache,
        stimme = %config.stimme,
        tools = config.werkzeuge.len(),
        "Verbinde mit Upstream"
    );

    let (upstream, ereignisse) =
        match tokio::time::timeout(timeout, state.connector.connect(config)).await {
            Ok(Ok(verbunden)) => verbunden,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(GatewayError::Upstream {
                    kategorie: FehlerKategorie::Zeitlimit,
                    nachricht: format!("Verbindungsaufbau nach {}s abgebrochen", timeout.as_secs()),
                })
            }
        };

    // Client waehrend des Aufbaus getrennt, gestoppt oder neu gestartet?
    if !noch_gewollt(state, id, generation) {
        tracing::info!(connection_id = %id, "Verbindung waehrend des Aufbaus beendet – schliesse neue Sitzung");
        upstream.close().await;
        return Ok(None);
    }

    let record = SessionRecord::neu(session_id.clone(), upstream);
    let epoche = record.epoche;
    if let Some(ersetzt) = state.registry.sitzung_einfuegen(id, record) {
        tracing::error!(
            connection_id = %id,
            ersetzte_epoche = ersetzt.epoche,
            "SessionRecord ueberschrieben – Lebenszyklus defekt"
        );
        sitzung_schliessen(state, id, ersetzt, "restart", false).await;
    }

    // Aufraeumen kann zwischen Pruefung und Einfuegen gelaufen sein
    let offen = state
        .registry
        .mit_verbindung(id, |s| {
            if s.phase == Phase::Startet && s.start_generation == generation {
                s.phase = Phase::Offen;
                true
            } else {
                false
            }
        })
        .unwrap_or(false);
    if !offen {
        if let Some(verwaist) = state.registry.sitzung_entfernen_wenn(id, epoche) {
            sitzung_schliessen(state, id, verwaist, "verbindung_getrennt", false).await;
        }
        return Ok(None);
    }

    state.last_aktualisieren();
    state.registry.senden(
        id,
        ServerMessage::SessionStarted {
            session_id: session_id.to_string(),
        },
    );
    state.registry.protokollieren(
        id,
        "sitzung_gestartet",
        json!({ "session_id": session_id.as_str(), "privilegiert": privilegiert }),
    );
    tracing::info!(connection_id = %id, session_id = %session_id, privilegiert, "Upstream-Sitzung geoeffnet");

    Ok(Some((epoche, ereignisse)))
}

/// Baut die Upstream-Konfiguration; jeder Fehler beendet nur diesen Startversuch
async fn sitzungs_config(
    state: &GatewayState,
    session_id: &SessionId,
    payload: &StartPayload,
) -> GatewayResult<SessionConfig> {
    let upstream = &state.config.upstream;

    let api_key = upstream
        .api_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .ok_or(GatewayError::CredentialFehlt)?;

    let sprache = payload
        .language_code
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| upstream.standard_sprache.clone());
    if !sprachcode_gueltig(&sprache) {
        return Err(GatewayError::Konfiguration(format!("Ungueltiger Sprachcode: {sprache}")));
    }

    let stimme = payload
        .voice_name
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| upstream.standard_stimme.clone());

    let mut system_anweisung = upstream.system_anweisung.clone();
    if let Some(kontext) = payload.user_context_text() {
        system_anweisung.push_str("\n\nKontext des Nutzers:\n");
        system_anweisung.push_str(&kontext);
    }

    if !session_id.ist_anonym() {
        match state.kollaborateure.verlauf.laden(session_id).await {
            Ok(Some(verlauf)) if !verlauf.trim().is_empty() => {
                system_anweisung.push_str("\n\nBisheriger Gespraechsverlauf:\n");
                system_anweisung.push_str(&verlauf);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(session_id = %session_id, fehler = %e, "Verlauf konnte nicht geladen werden");
            }
        }
    }

    Ok(SessionConfig {
        api_key,
        modell: upstream.modell.clone(),
        stimme,
        sprache,
        system_anweisung,
        werkzeuge: state.werkzeuge.deklarationen(),
    })
}

/// Grobe BCP-47-Pruefung (`de`, `de-DE`, `zh-Hans-CN`)
pub fn sprachcode_gueltig(code: &str) -> bool {
    let teile: Vec<&str> = code.split('-').collect();
    let Some((sprache, rest)) = teile.split_first() else {
        return false;
    };
    (2..=3).contains(&sprache.len())
        && sprache.chars().all(|c| c.is_ascii_alphabetic())
        && rest.len() <= 2
        && rest
            .iter()
            .all(|t| (2..=8).contains(&t.len()) && t.chars().all(|c| c.is_ascii_alphanumeric()))
}

// ---------------------------------------------------------------------------
// Ereignisschleife
// ---------------------------------------------------------------------------

async fn ereignisschleife(
    state: Arc<GatewayState>,
    id: ConnectionId,
    epoche: u64,
    session_id: SessionId,
    mut ereignisse: mpsc::Receiver<UpstreamEvent>,
) {
    let ende = loop {
        let Some(ereignis) = ereignisse.recv().await else {
            break Some((None, "upstream_closed".to_string()));
        };

        if !state.registry.ist_aktuell(id, epoche) {
            tracing::debug!(connection_id = %id, epoche, "Sitzung ersetzt – Ereignisschleife endet");
            break None;
        }

        match ereignis {
            UpstreamEvent::Opened => {
                tracing::debug!(connection_id = %id, "Upstream meldet offen");
            }
            UpstreamEvent::SetupComplete => setup_abgeschlossen(&state, id, epoche, &session_id),
            UpstreamEvent::Transcript { richtung, text, fertig } => {
                let payload = TranscriptPayload::neu(text.clone(), fertig);
                let nachricht = match richtung {
                    TranskriptRichtung::Eingabe => ServerMessage::InputTranscript(payload),
                    TranskriptRichtung::Ausgabe => ServerMessage::OutputTranscript(payload),
                };
                state.registry.senden(id, nachricht);
                if fertig {
                    transkript_abschliessen(&state, id, epoche, &session_id, richtung, text).await;
                }
            }
            UpstreamEvent::TextPart(content) => {
                state.registry.senden(id, ServerMessage::Text { content });
            }
            UpstreamEvent::AudioPart { data, mime_type } => {
                tracing::trace!(
                    connection_id = %id,
                    bytes_geschaetzt = data.len() * 3 / 4,
                    mime_type = %mime_type,
                    "Audio vom Upstream"
                );
                state.registry.senden(
                    id,
                    ServerMessage::Audio {
                        audio_data: data,
                        mime_type,
                    },
                );
            }
            UpstreamEvent::ToolCall(aufrufe) => {
                tool_aufrufe(&state, id, epoche, &session_id, aufrufe).await;
            }
            UpstreamEvent::TurnComplete => {
                state.turn_detector.abbrechen(id);
                state
                    .registry
                    .senden(id, ServerMessage::turn_complete(TurnGrund::Upstream));
            }
            UpstreamEvent::Error(nachricht) => break Some((Some(nachricht), "upstream_error".to_string())),
            UpstreamEvent::Closed { reason } => break Some((None, reason)),
        }
    };

    if let Some((fehler, grund)) = ende {
        beenden(&state, id, epoche, fehler, &grund).await;
    }
}

/// `setupComplete`: autoritatives Bereit-Signal
///
/// `setup_complete` wird jedes Mal weitergereicht, `session_ready` nur beim
/// ersten Mal pro Sitzung.
fn setup_abgeschlossen(state: &GatewayState, id: ConnectionId, epoche: u64, session_id: &SessionId) {
    let erstes_mal = state
        .registry
        .mit_sitzung_der_epoche(id, epoche, |r| !std::mem::replace(&mut r.setup_abgeschlossen, true))
        .unwrap_or(false);

    state.registry.mit_verbindung(id, |s| {
        if matches!(s.phase, Phase::Offen | Phase::Bereit) {
            s.is_ready = true;
            s.phase = Phase::Bereit;
        }
    });

    state.registry.senden(id, ServerMessage::SetupComplete);
    if erstes_mal {
        state
            .registry
            .senden(id, ServerMessage::session_ready(session_id.as_str()));
        state.registry.protokollieren(id, "sitzung_bereit", json!({}));
        tracing::info!(connection_id = %id, session_id = %session_id, "Sitzung bereit");
    } else {
        tracing::debug!(connection_id = %id, "Wiederholtes setupComplete");
    }
}

async fn transkript_abschliessen(
    state: &Arc<GatewayState>,
    id: ConnectionId,
    epoche: u64,
    session_id: &SessionId,
    richtung: TranskriptRichtung,
    text: String,
) {
    let sprecher = match richtung {
        TranskriptRichtung::Eingabe => Sprecher::Nutzer,
        TranskriptRichtung::Ausgabe => Sprecher::Assistent,
    };
    if let Err(e) = state.kollaborateure.kontext.add_turn(session_id, sprecher, &text).await {
        tracing::warn!(connection_id = %id, fehler = %e, "Turn konnte nicht gespeichert werden");
    }
    state.registry.protokollieren(
        id,
        "transkript_final",
        json!({ "sprecher": sprecher, "zeichen": text.chars().count() }),
    );

    match richtung {
        TranskriptRichtung::Eingabe => {
            state.registry.mit_sitzung_der_epoche(id, epoche, |r| {
                r.user_turn_count += 1;
                r.letzte_nutzer_aeusserung = Some(text.clone());
            });
            state.injektor.bei_nutzer_transkript(id, &text);
        }
        TranskriptRichtung::Ausgabe => {
            let sync = state
                .registry
                .mit_sitzung_der_epoche(id, epoche, |r| {
                    r.letzte_assistent_aeusserung = Some(text);
                    let turn = r.user_turn_count;
                    if r.sync_laeuft || r.letzter_sync_turn == Some(turn) {
                        return None;
                    }
                    r.sync_laeuft = true;
                    r.letzter_sync_turn = Some(turn);

                    let mut nachrichten = Vec::with_capacity(2);
                    if let Some(text) = r.letzte_nutzer_aeusserung.take() {
                        nachrichten.push(TurnNachricht {
                            sprecher: Sprecher::Nutzer,
                            text,
                        });
                    }
                    if let Some(text) = r.letzte_assistent_aeusserung.take() {
                        nachrichten.push(TurnNachricht {
                            sprecher: Sprecher::Assistent,
                            text,
                        });
                    }
                    Some((turn, nachrichten))
                })
                .flatten();

            match sync {
                Some((turn, nachrichten)) => {
                    orchestrierung_anstossen(state, id, epoche, session_id.clone(), turn, nachrichten)
                }
                None => tracing::debug!(connection_id = %id, "Sync fuer diesen Turn bereits erfolgt oder laufend"),
            }
        }
    }
}

fn orchestrierung_anstossen(
    state: &Arc<GatewayState>,
    id: ConnectionId,
    epoche: u64,
    session_id: SessionId,
    turn: u64,
    nachrichten: Vec<TurnNachricht>,
) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        let ergebnis = state
            .kollaborateure
            .orchestrator
            .synchronisieren(&session_id, &nachrichten)
            .await;
        let aktuell = state
            .registry
            .mit_sitzung_der_epoche(id, epoche, |r| r.sync_laeuft = false)
            .is_some();

        match ergebnis {
            Ok(Some(stufe)) if aktuell => {
                state.registry.senden(id, ServerMessage::StageUpdate(stufe));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(connection_id = %id, turn, fehler = %e, "Orchestrierungs-Sync fehlgeschlagen");
            }
        }
    });
}

async fn tool_aufrufe(
    state: &Arc<GatewayState>,
    id: ConnectionId,
    epoche: u64,
    session_id: &SessionId,
    aufrufe: Vec<FunctionCall>,
) {
    let Some(upstream) = state
        .registry
        .mit_sitzung_der_epoche(id, epoche, |r| Arc::clone(&r.upstream))
    else {
        return;
    };

    let namen: Vec<String> = aufrufe.iter().map(|a| a.name.clone()).collect();
    tracing::debug!(connection_id = %id, tools = ?namen, "Tool-Batch vom Upstream");

    let ergebnis = state
        .tool_prozessor
        .verarbeiten(id, session_id, &upstream, aufrufe)
        .await;
    state.registry.protokollieren(
        id,
        "tool_calls",
        json!({ "tools": namen, "handled": ergebnis.handled }),
    );

    if ergebnis.handled {
        state.registry.senden(
            id,
            ServerMessage::ToolCall(ToolCallPayload {
                responses: Some(ergebnis.antworten),
                error: None,
            }),
        );
    } else {
        let fehler = GatewayError::ToolAufruf("Tool-Ergebnisse konnten nicht gesendet werden".into());
        state.registry.senden(
            id,
            ServerMessage::ToolCall(ToolCallPayload {
                responses: None,
                error: Some(fehler.to_string()),
            }),
        );
        state.registry.senden(id, fehler.als_nachricht());
    }
}

/// Upstream-Fehler oder -Ende: Record entfernen, Client benachrichtigen
///
/// Gehoert der Record nicht mehr zu dieser Epoche (Restart, Stop,
/// Verbindungsabbau), wurde bereits aufgeraeumt und es geht nichts an den
/// Client.
async fn beenden(
    state: &Arc<GatewayState>,
    id: ConnectionId,
    epoche: u64,
    fehler: Option<String>,
    grund: &str,
) {
    let Some(record) = state.registry.sitzung_entfernen_wenn(id, epoche) else {
        tracing::debug!(connection_id = %id, grund, "Sitzung bereits abgebaut – keine Benachrichtigung");
        return;
    };

    state.registry.mit_verbindung(id, |s| {
        s.is_ready = false;
        if s.phase != Phase::Startet {
            s.phase = Phase::Geschlossen;
        }
    });

    if let Some(nachricht) = fehler {
        let fehler = GatewayError::upstream(nachricht);
        if let GatewayError::Upstream { kategorie, .. } = &fehler {
            state
                .metriken
                .upstream_errors_total
                .with_label_values(&[kategorie.label()])
                .inc();
        }
        tracing::warn!(connection_id = %id, fehler = %fehler, "Upstream-Fehler");
        state.registry.senden(id, fehler.als_nachricht());
    }

    sitzung_schliessen(state, id, record, grund, true).await;
}
