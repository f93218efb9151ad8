//! Eingaben: Bereitschaft, Budgets, Sitzungs-Suche, Injektion

use std::sync::Arc;
use std::time::Duration;

use livegate_core::{Modalitaet, SessionId};
use livegate_protocol::ErrorCode;
use serde_json::{json, Value};

use super::*;
use crate::rate_limit::RateLimitKonfig;
use crate::registry::SessionRecord;

fn realtime_frame(mime_type: &str) -> Value {
    json!({
        "type": "REALTIME_INPUT",
        "payload": { "chunks": [ { "mimeType": mime_type, "data": "AAAA" } ] }
    })
}

fn tool_result_frame() -> Value {
    json!({
        "type": "TOOL_RESULT",
        "payload": {
            "responses": [ { "id": "c1", "name": "kalender_pruefen", "response": { "frei": true } } ]
        }
    })
}

fn context_frame(modality: &str, bild: Option<&str>) -> Value {
    json!({
        "type": "CONTEXT_UPDATE",
        "payload": {
            "modality": modality,
            "analysis": "Preisliste mit drei Paketen",
            "imageData": bild,
            "capturedAt": 1_700_000_000_000i64
        }
    })
}

/// Bereit ohne Record: simuliert das Fenster zwischen Setup und Eintrag
/// Stand zwischen Entfernen des Records und Loeschen von `is_ready` beim Upstream-Ende
fn bereit_ohne_sitzung(env: &Umgebung, id: ConnectionId) {
    env.state.registry.mit_verbindung(id, |s| s.is_ready = true);
}

#[tokio::test(start_paused = true)]
async fn nichts_geht_vor_setup_complete_an_den_upstream() {
    let env = Umgebung::neu();
    let (id, mut empfaenger) = env.verbinden();
    env.frame(id, json!({ "type": "start" })).await;
    ruhen().await;
    // Upstream offen, Setup noch nicht bestaetigt
    assert_eq!(env.connector.anzahl(), 1);
    nachrichten(&mut empfaenger);

    env.frame(id, audio_frame()).await;
    env.frame(id, realtime_frame("image/jpeg")).await;
    env.frame(id, tool_result_frame()).await;
    env.frame(id, context_frame("screen", Some("/9j/4AAQ"))).await;

    let alle = nachrichten(&mut empfaenger);
    assert_eq!(fehlercodes(&alle), vec![ErrorCode::LiveNotReady; 4]);
    let sitzung = env.connector.sitzung(0);
    assert_eq!(sitzung.eingaben_anzahl(), 0);
    assert!(sitzung.tool_antworten.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn ohne_start_nicht_bereit() {
    let env = Umgebung::neu();
    let (id, mut empfaenger) = env.verbinden();
    nachrichten(&mut empfaenger);

    env.frame(id, audio_frame()).await;
    assert_eq!(fehlercodes(&nachrichten(&mut empfaenger)), vec![ErrorCode::LiveNotReady]);
    assert_eq!(env.connector.anzahl(), 0);
}

#[tokio::test(start_paused = true)]
async fn audio_wird_weitergereicht() {
    let env = Umgebung::neu();
    let (id, mut empfaenger) = env.verbinden();
    env.bereit_machen(id, 0).await;
    nachrichten(&mut empfaenger);

    env.frame(id, audio_frame()).await;

    assert!(nachrichten(&mut empfaenger).is_empty());
    let eingaben = env.connector.sitzung(0).eingaben.lock().unwrap().clone();
    assert_eq!(eingaben.len(), 1);
    assert_eq!(eingaben[0][0].mime_type, "audio/pcm;rate=16000");
    assert_eq!(env.state.registry.mit_sitzung(id, |r| r.audio_chunk_count), Some(1));
}

#[tokio::test(start_paused = true)]
async fn audio_budget_pro_sekunde() {
    let env = Umgebung::neu();
    let (id, mut empfaenger) = env.verbinden();
    env.bereit_machen(id, 0).await;
    nachrichten(&mut empfaenger);

    for _ in 0..201 {
        env.frame(id, audio_frame()).await;
    }

    let alle = nachrichten(&mut empfaenger);
    let fehler: Vec<_> = alle
        .iter()
        .filter_map(|n| match n {
            ServerMessage::Error(e) => Some(e.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(fehler.len(), 1);
    assert_eq!(fehler[0].code, ErrorCode::RateLimitExceeded);
    assert_eq!(fehler[0].remaining, Some(1));
    assert_eq!(env.connector.sitzung(0).eingaben_anzahl(), 200);
    assert_eq!(
        env.state
            .metriken
            .rate_limited_total
            .with_label_values(&["audio"])
            .get(),
        1
    );

    // Neues Fenster
    tokio::time::sleep(Duration::from_millis(1100)).await;
    env.frame(id, audio_frame()).await;
    assert!(fehlercodes(&nachrichten(&mut empfaenger)).is_empty());
    assert_eq!(env.connector.sitzung(0).eingaben_anzahl(), 201);
}

#[tokio::test(start_paused = true)]
async fn medien_budget_greift() {
    let mut config = test_config();
    config.limits = RateLimitKonfig {
        medien_pro_minute: 2,
        ..RateLimitKonfig::default()
    };
    let env = Umgebung::mit_config(config);
    let (id, mut empfaenger) = env.verbinden();
    env.bereit_machen(id, 0).await;
    nachrichten(&mut empfaenger);

    for _ in 0..3 {
        env.frame(id, realtime_frame("image/jpeg")).await;
    }
    // Audio hat ein eigenes Budget
    env.frame(id, realtime_frame("audio/pcm;rate=16000")).await;

    let alle = nachrichten(&mut empfaenger);
    assert_eq!(fehlercodes(&alle), vec![ErrorCode::RateLimitExceeded]);
    assert_eq!(env.connector.sitzung(0).eingaben_anzahl(), 3);
}

#[tokio::test(start_paused = true)]
async fn text_im_medienkanal_wird_abgelehnt() {
    let env = Umgebung::neu();
    let (id, mut empfaenger) = env.verbinden();
    env.bereit_machen(id, 0).await;
    nachrichten(&mut empfaenger);

    env.frame(id, realtime_frame("text/plain")).await;
    env.frame(
        id,
        json!({ "type": "REALTIME_INPUT", "payload": { "chunks": [] } }),
    )
    .await;

    assert_eq!(
        fehlercodes(&nachrichten(&mut empfaenger)),
        vec![ErrorCode::InvalidMessage, ErrorCode::InvalidMessage]
    );
    assert_eq!(env.connector.sitzung(0).eingaben_anzahl(), 0);
}

#[tokio::test(start_paused = true)]
async fn realtime_input_wartet_auf_spaeten_record() {
    let env = Umgebung::neu();
    let (id, mut empfaenger) = env.verbinden();
    bereit_ohne_sitzung(&env, id);
    nachrichten(&mut empfaenger);

    let router = env.router.clone();
    let text = realtime_frame("audio/pcm;rate=16000").to_string();
    let verarbeitung = tokio::spawn(async move { router.frame_verarbeiten(id, &text).await });

    tokio::time::sleep(Duration::from_millis(150)).await;
    let sitzung = Arc::new(StummeSitzung::default());
    env.state
        .registry
        .sitzung_einfuegen(id, SessionRecord::neu(SessionId::neu("lead-9"), sitzung.clone()));
    verarbeitung.await.unwrap();

    assert!(fehlercodes(&nachrichten(&mut empfaenger)).is_empty());
    assert_eq!(sitzung.eingaben_anzahl(), 1);
}

#[tokio::test(start_paused = true)]
async fn realtime_input_ohne_record_nach_wartezeit() {
    let env = Umgebung::neu();
    let (id, mut empfaenger) = env.verbinden();
    bereit_ohne_sitzung(&env, id);
    nachrichten(&mut empfaenger);

    let start = tokio::time::Instant::now();
    env.frame(id, realtime_frame("image/jpeg")).await;

    assert_eq!(fehlercodes(&nachrichten(&mut empfaenger)), vec![ErrorCode::NoActiveSession]);
    // 5 Versuche, 4 Pausen zu je 100 ms
    let gewartet = start.elapsed();
    assert!(gewartet >= Duration::from_millis(400) && gewartet < Duration::from_millis(500));
}

#[tokio::test(start_paused = true)]
async fn realtime_input_waehrend_aufbau_wartet_nicht() {
    let env = Umgebung::mit(
        test_config(),
        FakeConnector::mit_verzoegerung(Duration::from_secs(2)),
        Kollaborateure::standard(Vec::new()),
    );
    let (id, mut empfaenger) = env.verbinden();
    env.frame(id, json!({ "type": "start" })).await;
    nachrichten(&mut empfaenger);

    let start = tokio::time::Instant::now();
    env.frame(id, realtime_frame("audio/pcm;rate=16000")).await;

    assert_eq!(fehlercodes(&nachrichten(&mut empfaenger)), vec![ErrorCode::LiveNotReady]);
    assert!(start.elapsed() < Duration::from_millis(100));
    assert!(!env.state.registry.hat_sitzung(id));
}

#[tokio::test(start_paused = true)]
async fn tool_result_ohne_sitzung() {
    let env = Umgebung::neu();
    let (id, mut empfaenger) = env.verbinden();
    bereit_ohne_sitzung(&env, id);
    nachrichten(&mut empfaenger);

    env.frame(id, tool_result_frame()).await;

    assert_eq!(fehlercodes(&nachrichten(&mut empfaenger)), vec![ErrorCode::NoActiveSession]);
    assert_eq!(env.connector.anzahl(), 0);
}

#[tokio::test(start_paused = true)]
async fn tool_result_wird_gebuendelt_weitergeleitet() {
    let env = Umgebung::neu();
    let (id, mut empfaenger) = env.verbinden();
    env.bereit_machen(id, 0).await;
    nachrichten(&mut empfaenger);

    env.frame(id, tool_result_frame()).await;
    env.frame(id, json!({ "type": "TOOL_RESULT", "payload": { "responses": [] } }))
        .await;

    assert_eq!(fehlercodes(&nachrichten(&mut empfaenger)), vec![ErrorCode::InvalidMessage]);
    let antworten = env.connector.sitzung(0).tool_antworten.lock().unwrap().clone();
    assert_eq!(antworten.len(), 1);
    assert_eq!(antworten[0][0].name, "kalender_pruefen");
    assert_eq!(antworten[0][0].response, json!({ "frei": true }));
}

#[tokio::test(start_paused = true)]
async fn context_update_wird_nach_entprellung_injiziert() {
    let env = Umgebung::neu();
    let (id, mut empfaenger) = env.verbinden();
    env.bereit_machen(id, 0).await;
    nachrichten(&mut empfaenger);

    env.frame(id, context_frame("screen", Some("/9j/4AAQ"))).await;
    let sitzung = env.connector.sitzung(0);
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(sitzung.eingaben_anzahl(), 0);

    tokio::time::sleep(Duration::from_millis(600)).await;
    let eingaben = sitzung.eingaben.lock().unwrap().clone();
    assert_eq!(eingaben.len(), 1);
    assert_eq!(eingaben[0][0].mime_type, "image/jpeg");
    assert_eq!(eingaben[0][0].data, "/9j/4AAQ");
    let kontexte = sitzung.kontexte.lock().unwrap().clone();
    assert_eq!(kontexte.len(), 1);
    assert!(kontexte[0].contains("Preisliste mit drei Paketen"));
    assert!(fehlercodes(&nachrichten(&mut empfaenger)).is_empty());
}

#[tokio::test(start_paused = true)]
async fn context_update_kamera_alias_und_snapshot() {
    let env = Umgebung::neu();
    let (id, mut empfaenger) = env.verbinden();
    env.bereit_machen(id, 0).await;
    nachrichten(&mut empfaenger);

    env.frame(id, context_frame("camera", None)).await;

    assert!(fehlercodes(&nachrichten(&mut empfaenger)).is_empty());
    let snapshot = env
        .state
        .registry
        .mit_sitzung(id, |r| {
            r.snapshots
                .get(&Modalitaet::Webcam)
                .map(|s| (s.analysis.clone(), s.captured_at, s.image_data.clone()))
        })
        .flatten();
    assert_eq!(
        snapshot,
        Some(("Preisliste mit drei Paketen".to_string(), Some(1_700_000_000_000), None))
    );

    // Ohne Bild keine Injektion
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(env.connector.sitzung(0).eingaben_anzahl(), 0);
}

#[tokio::test(start_paused = true)]
async fn unbekannte_modalitaet() {
    let env = Umgebung::neu();
    let (id, mut empfaenger) = env.verbinden();
    env.bereit_machen(id, 0).await;
    nachrichten(&mut empfaenger);

    env.frame(id, context_frame("mikrofon", Some("/9j/4AAQ"))).await;

    assert_eq!(fehlercodes(&nachrichten(&mut empfaenger)), vec![ErrorCode::InvalidMessage]);
    assert_eq!(env.state.registry.mit_sitzung(id, |r| r.snapshots.len()), Some(0));
}
