//! Eingaben vom Client an die offene Sitzung weiterreichen
//!
//! Reihenfolge der Pruefungen in jedem Handler:
//! Bereitschaft -> Budget -> Sitzung -> Upstream. Solange `is_ready` falsch
//! ist, geht nichts an den Upstream.

use std::sync::Arc;
use std::time::Duration;

use livegate_core::{ConnectionId, Modalitaet};
use livegate_protocol::{
    ContextUpdatePayload, MediaChunk, RealtimeInputPayload, ToolResultPayload, UserAudioPayload,
};
use serde_json::Value;
use tokio::time::Instant;

use crate::error::{GatewayError, GatewayResult};
use crate::rate_limit::LimitKlasse;
use crate::registry::Snapshot;
use crate::state::GatewayState;
use crate::upstream::UpstreamSession;

/// Mindestabstand zwischen zwei gespeicherten Analysen je Modalitaet
const PERSISTENZ_ABSTAND: Duration = Duration::from_secs(5);

fn bereit_pruefen(state: &GatewayState, id: ConnectionId) -> GatewayResult<()> {
    if state.registry.ist_bereit(id) {
        Ok(())
    } else {
        Err(GatewayError::NichtBereit)
    }
}

/// Verbraucht ein Budget-Element der Klasse
pub(crate) fn budget(state: &GatewayState, id: ConnectionId, klasse: LimitKlasse) -> GatewayResult<()> {
    state.rate_limiter.pruefen(id, klasse).map_err(|remaining_secs| {
        state
            .metriken
            .rate_limited_total
            .with_label_values(&[klasse.label()])
            .inc();
        GatewayError::RateLimit {
            klasse,
            remaining_secs,
        }
    })
}

/// `user_audio`: ein Mikrofon-Chunk
pub async fn user_audio(
    state: &Arc<GatewayState>,
    id: ConnectionId,
    payload: UserAudioPayload,
) -> GatewayResult<()> {
    bereit_pruefen(state, id)?;
    if payload.audio_data.is_empty() {
        return Err(GatewayError::ungueltig("user_audio ohne audioData"));
    }
    budget(state, id, LimitKlasse::Audio)?;

    let upstream = state
        .registry
        .mit_sitzung(id, |r| {
            r.audio_chunk_count += 1;
            Arc::clone(&r.upstream)
        })
        .ok_or(GatewayError::KeineSitzung)?;

    upstream
        .send_input(vec![MediaChunk {
            mime_type: payload.mime_type,
            data: payload.audio_data,
        }])
        .await?;

    state.turn_detector.zuruecksetzen(id);
    Ok(())
}

/// `REALTIME_INPUT`: gebuendelte Audio-, Bild- und Video-Chunks
///
/// Ist die Verbindung bereit, der Record aber nicht eingetragen, wird kurz
/// gewartet (Versuche x Intervall aus der Konfiguration), danach
/// `NO_ACTIVE_SESSION`. Waehrend des Sitzungsaufbaus greift vorher schon
/// `LIVE_NOT_READY`, denn `is_ready` wird erst nach dem Eintragen gesetzt.
/// Erreichbar ist die Wartezeit, weil `is_ready` und der Record in zwei
/// getrennten Maps liegen: beim Upstream-Ende (`session::beenden`) wird
/// erst der Record entfernt und dann das Flag geloescht, ein Frame auf einem
/// anderen Worker-Thread sieht dazwischen "bereit, aber ohne Sitzung".
pub async fn realtime_input(
    state: &Arc<GatewayState>,
    id: ConnectionId,
    payload: RealtimeInputPayload,
) -> GatewayResult<()> {
    bereit_pruefen(state, id)?;

    if payload.chunks.is_empty() {
        return Err(GatewayError::ungueltig("REALTIME_INPUT ohne chunks"));
    }
    // Text gehoert nicht in den Medienkanal
    if let Some(chunk) = payload
        .chunks
        .iter()
        .find(|c| !c.ist_audio() && !c.ist_bild_oder_video())
    {
        return Err(GatewayError::ungueltig(format!(
            "mimeType {} im Medienkanal nicht erlaubt",
            chunk.mime_type
        )));
    }

    for chunk in &payload.chunks {
        let klasse = if chunk.ist_audio() {
            LimitKlasse::Audio
        } else {
            LimitKlasse::Medien
        };
        budget(state, id, klasse)?;
    }

    let upstream = sitzung_abwarten(state, id)
        .await
        .ok_or(GatewayError::KeineSitzung)?;

    let audio = payload.chunks.iter().filter(|c| c.ist_audio()).count() as u64;
    if audio > 0 {
        state
            .registry
            .mit_sitzung(id, |r| r.audio_chunk_count += audio);
    }

    upstream.send_input(payload.chunks).await?;

    if audio > 0 {
        state.turn_detector.zuruecksetzen(id);
    }
    Ok(())
}

async fn sitzung_abwarten(state: &GatewayState, id: ConnectionId) -> Option<Arc<dyn UpstreamSession>> {
    let versuche = state.config.sitzung_warte_versuche.max(1);
    for versuch in 1..=versuche {
        if let Some(upstream) = state.registry.upstream(id) {
            return Some(upstream);
        }
        if versuch < versuche {
            tracing::debug!(connection_id = %id, versuch, "REALTIME_INPUT vor Sitzungseintrag – warte");
            tokio::time::sleep(state.config.sitzung_warte_intervall).await;
        }
    }
    tracing::warn!(connection_id = %id, versuche, "Keine Sitzung nach Wartezeit");
    None
}

/// `TOOL_RESULT`: Ergebnisse client-seitiger Tools
pub async fn tool_result(
    state: &Arc<GatewayState>,
    id: ConnectionId,
    payload: ToolResultPayload,
) -> GatewayResult<()> {
    bereit_pruefen(state, id)?;
    budget(state, id, LimitKlasse::Allgemein)?;

    let (upstream, session_id) = state
        .registry
        .mit_sitzung(id, |r| (Arc::clone(&r.upstream), r.session_id.clone()))
        .ok_or(GatewayError::KeineSitzung)?;

    if payload.responses.is_empty() {
        return Err(GatewayError::ungueltig("TOOL_RESULT ohne responses"));
    }

    upstream.send_tool_response(payload.responses.clone()).await?;
    tracing::debug!(connection_id = %id, anzahl = payload.responses.len(), "Tool-Ergebnisse weitergeleitet");

    // Aufzeichnung darf die Antwort nicht verzoegern
    let store = Arc::clone(&state.kollaborateure.kontext);
    tokio::spawn(async move {
        for antwort in payload.responses {
            if let Err(e) = store
                .add_tool_call_to_turn(&session_id, &antwort.name, &Value::Null, &antwort.response)
                .await
            {
                tracing::debug!(session_id = %session_id, tool = %antwort.name, fehler = %e, "Tool-Ergebnis nicht aufgezeichnet");
            }
        }
    });
    Ok(())
}

/// `CONTEXT_UPDATE`: neuer Snapshot einer Modalitaet
pub async fn context_update(
    state: &Arc<GatewayState>,
    id: ConnectionId,
    payload: ContextUpdatePayload,
) -> GatewayResult<()> {
    bereit_pruefen(state, id)?;
    budget(state, id, LimitKlasse::Allgemein)?;

    let modalitaet: Modalitaet = payload
        .modality
        .parse()
        .map_err(|e: livegate_core::LivegateError| GatewayError::ungueltig(e.to_string()))?;

    let jetzt = Instant::now();
    let (session_id, persistieren) = state
        .registry
        .mit_sitzung(id, |r| {
            let snapshot = r
                .snapshots
                .entry(modalitaet)
                .or_insert_with(|| Snapshot::neu(jetzt));
            snapshot.analysis = payload.analysis.clone();
            snapshot.captured_at = payload.captured_at;
            snapshot.image_data = payload.image_data.clone();
            snapshot.empfangen = jetzt;

            let faellig = !payload.analysis.trim().is_empty()
                && snapshot
                    .last_persisted
                    .map_or(true, |t| jetzt.saturating_duration_since(t) >= PERSISTENZ_ABSTAND);
            if faellig {
                snapshot.last_persisted = Some(jetzt);
            }
            (r.session_id.clone(), faellig)
        })
        .ok_or(GatewayError::KeineSitzung)?;

    tracing::trace!(
        connection_id = %id,
        modalitaet = %modalitaet,
        mit_bild = payload.image_data.is_some(),
        "Snapshot aktualisiert"
    );

    if persistieren {
        let store = Arc::clone(&state.kollaborateure.kontext);
        let analyse = payload.analysis;
        tokio::spawn(async move {
            if let Err(e) = store.add_transcript(&session_id, modalitaet, &analyse).await {
                tracing::debug!(session_id = %session_id, fehler = %e, "Analyse nicht gespeichert");
            }
        });
    }

    state.injektor.planen(id, modalitaet);
    Ok(())
}
