//! Router und Keepalive

use std::time::Duration;

use livegate_protocol::ErrorCode;
use serde_json::json;
use tokio::time::Instant;

use super::*;
use crate::heartbeat::{self, SweepErgebnis};
use crate::rate_limit::RateLimitKonfig;

#[tokio::test(start_paused = true)]
async fn ping_ergibt_pong_ohne_rate_limit() {
    let mut config = test_config();
    config.limits = RateLimitKonfig {
        allgemein_pro_minute: 1,
        ..RateLimitKonfig::default()
    };
    let env = Umgebung::mit_config(config);
    let (id, mut empfaenger) = env.verbinden();
    nachrichten(&mut empfaenger);

    for _ in 0..300 {
        env.frame(id, json!({ "type": "ping" })).await;
    }
    // Abweichende Formatierung
    env.router.frame_verarbeiten(id, r#"{ "type" : "ping" }"#).await;

    let alle = nachrichten(&mut empfaenger);
    assert_eq!(anzahl_typ(&alle, "pong"), 301);
    assert!(fehlercodes(&alle).is_empty());
}

#[tokio::test(start_paused = true)]
async fn pong_ueberholt_volle_queue() {
    let env = Umgebung::neu();
    let (id, mut empfaenger) = env.verbinden();
    env.bereit_machen(id, 0).await;

    for _ in 0..20 {
        env.connector.ereignis(0, UpstreamEvent::TextPart("Stau".into())).await;
    }
    ruhen().await;
    env.frame(id, json!({ "type": "ping" })).await;

    match empfaenger.try_naechste() {
        Some(Ausgehend::Nachricht(ServerMessage::Pong { .. })) => {}
        andere => panic!("Erwartet pong zuerst, erhalten {andere:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn kaputte_und_unbekannte_frames_werden_verworfen() {
    let env = Umgebung::neu();
    let (id, mut empfaenger) = env.verbinden();
    nachrichten(&mut empfaenger);

    env.router.frame_verarbeiten(id, "kein json").await;
    env.router.frame_verarbeiten(id, "[1, 2, 3]").await;
    env.frame(id, json!({ "type": "unbekannt", "payload": {} })).await;
    env.frame(id, json!({ "type": "user_audio" })).await;
    env.frame(id, json!({ "payload": { "audioData": "AAAA" } })).await;

    assert!(nachrichten(&mut empfaenger).is_empty());
    assert!(env.state.registry.hat_verbindung(id));

    // Verbindung funktioniert weiter
    env.frame(id, json!({ "type": "ping" })).await;
    assert_eq!(anzahl_typ(&nachrichten(&mut empfaenger), "pong"), 1);
}

#[tokio::test(start_paused = true)]
async fn frames_werden_gezaehlt() {
    let env = Umgebung::neu();
    let (id, _empfaenger) = env.verbinden();

    env.frame(id, audio_frame()).await;
    env.frame(id, audio_frame()).await;
    env.frame(id, json!({ "type": "heartbeat_ack" })).await;

    let frames = &env.state.metriken.frames_total;
    assert_eq!(frames.with_label_values(&["user_audio"]).get(), 2);
    assert_eq!(frames.with_label_values(&["heartbeat_ack"]).get(), 1);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_ack_aktualisiert_last_ping() {
    let env = Umgebung::neu();
    let (id, _empfaenger) = env.verbinden();
    let vorher = env.state.registry.mit_verbindung(id, |s| s.last_ping).unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    env.frame(id, json!({ "type": "heartbeat_ack" })).await;

    let nachher = env.state.registry.mit_verbindung(id, |s| s.last_ping).unwrap();
    assert_eq!(nachher.duration_since(vorher), Duration::from_secs(30));
    assert_eq!(nachher, Instant::now());
}

#[tokio::test(start_paused = true)]
async fn stop_verbraucht_allgemeines_budget() {
    let mut config = test_config();
    config.limits = RateLimitKonfig {
        allgemein_pro_minute: 1,
        ..RateLimitKonfig::default()
    };
    let env = Umgebung::mit_config(config);
    let (id, mut empfaenger) = env.verbinden();
    nachrichten(&mut empfaenger);

    env.frame(id, json!({ "type": "stop" })).await;
    env.frame(id, json!({ "type": "stop" })).await;

    let alle = nachrichten(&mut empfaenger);
    assert_eq!(anzahl_typ(&alle, "session_closed"), 1);
    assert_eq!(fehlercodes(&alle), vec![ErrorCode::RateLimitExceeded]);
    assert_eq!(
        env.state
            .metriken
            .rate_limited_total
            .with_label_values(&["allgemein"])
            .get(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn sweep_beendet_stille_und_pingt_aktive_verbindungen() {
    let env = Umgebung::neu();
    let (still, _still_empfaenger) = env.verbinden();
    let (aktiv, mut aktiv_empfaenger) = env.verbinden();
    nachrichten(&mut aktiv_empfaenger);

    tokio::time::sleep(Duration::from_secs(61)).await;
    env.frame(aktiv, json!({ "type": "heartbeat_ack" })).await;

    let ergebnis = heartbeat::durchlauf(&env.state);
    assert_eq!(
        ergebnis,
        SweepErgebnis {
            gepingt: 1,
            beendet: 1
        }
    );

    let abgebrochen = |id| {
        env.state
            .registry
            .mit_verbindung(id, |s| s.abbruch.is_cancelled())
            .unwrap()
    };
    assert!(abgebrochen(still));
    assert!(!abgebrochen(aktiv));
    assert!(matches!(aktiv_empfaenger.try_naechste(), Some(Ausgehend::Ping)));
}

#[tokio::test(start_paused = true)]
async fn sweep_schleife_endet_mit_shutdown() {
    let mut config = test_config();
    config.heartbeat_intervall = Duration::from_secs(5);
    config.heartbeat_timeout = Duration::from_secs(12);
    let env = Umgebung::mit_config(config);
    let (id, _empfaenger) = env.verbinden();

    let shutdown = tokio_util::sync::CancellationToken::new();
    let schleife = tokio::spawn(heartbeat::sweep_schleife(
        Arc::clone(&env.state),
        shutdown.clone(),
    ));

    tokio::time::sleep(Duration::from_secs(16)).await;
    assert_eq!(
        env.state.registry.mit_verbindung(id, |s| s.abbruch.is_cancelled()),
        Some(true)
    );

    shutdown.cancel();
    schleife.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn connected_ist_erste_nachricht() {
    let env = Umgebung::neu();
    let (id, mut empfaenger) = env.verbinden();
    env.frame(id, json!({ "type": "stop" })).await;

    let alle = nachrichten(&mut empfaenger);
    assert_eq!(alle.first().map(|n| n.typ()), Some("connected"));
    assert_eq!(alle.len(), 2);
    assert_eq!(env.state.metriken.active_connections.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn ping_ueberholt_haengenden_audio_frame() {
    let env = Umgebung::neu();
    let (id, mut empfaenger) = env.verbinden();
    env.bereit_machen(id, 0).await;
    nachrichten(&mut empfaenger);

    let sitzung = env.connector.sitzung(0);
    sitzung.haengen.store(true, Ordering::SeqCst);

    let queue = env.router.frame_queue(id);
    assert!(queue.einreihen(audio_frame().to_string()));
    assert!(queue.einreihen(audio_frame().to_string()));
    ruhen().await;

    assert!(queue.einreihen(json!({ "type": "ping" }).to_string()));
    let alle = nachrichten(&mut empfaenger);
    assert_eq!(anzahl_typ(&alle, "pong"), 1);
    assert_eq!(sitzung.eingaben_anzahl(), 0);

    // Erst der erste, dann der zweite Audio-Frame
    sitzung.haengen.store(false, Ordering::SeqCst);
    sitzung.freigabe.notify_one();
    ruhen().await;
    assert_eq!(sitzung.eingaben_anzahl(), 2);

    queue.beenden(Duration::from_secs(2)).await;
}

#[tokio::test(start_paused = true)]
async fn beenden_bricht_haengenden_handler_ab() {
    let env = Umgebung::neu();
    let (id, _empfaenger) = env.verbinden();
    env.bereit_machen(id, 0).await;

    let sitzung = env.connector.sitzung(0);
    sitzung.haengen.store(true, Ordering::SeqCst);

    let queue = env.router.frame_queue(id);
    queue.einreihen(audio_frame().to_string());
    queue.einreihen(json!({ "type": "stop" }).to_string());
    ruhen().await;

    let start = Instant::now();
    queue.beenden(Duration::from_secs(2)).await;
    assert!(start.elapsed() >= Duration::from_secs(2));

    // Der wartende stop wurde nicht mehr verarbeitet
    assert!(env.state.registry.hat_sitzung(id));
    assert_eq!(sitzung.eingaben_anzahl(), 0);
}

#[tokio::test(start_paused = true)]
async fn frame_queue_haelt_reihenfolge_ein() {
    let env = Umgebung::neu();
    let (id, mut empfaenger) = env.verbinden();
    env.bereit_machen(id, 0).await;
    nachrichten(&mut empfaenger);

    let queue = env.router.frame_queue(id);
    queue.einreihen(audio_frame().to_string());
    queue.einreihen(json!({ "type": "stop" }).to_string());
    queue.einreihen(audio_frame().to_string());
    ruhen().await;

    // Audio vor stop wird weitergeleitet, Audio danach trifft keine bereite Sitzung
    assert_eq!(env.connector.sitzung(0).eingaben_anzahl(), 1);
    let alle = nachrichten(&mut empfaenger);
    assert_eq!(anzahl_typ(&alle, "session_closed"), 1);
    assert_eq!(fehlercodes(&alle), vec![ErrorCode::LiveNotReady]);

    queue.beenden(Duration::from_secs(2)).await;
}
