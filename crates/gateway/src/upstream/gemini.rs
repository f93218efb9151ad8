//! Gemini-Live-Client ueber tokio-tungstenite
//!
//! Protokoll (BidiGenerateContent, JSON pro WebSocket-Nachricht):
//! - Client: `setup`, `realtimeInput.mediaChunks`, `toolResponse`, `clientContent`
//! - Server: `setupComplete`, `serverContent`, `toolCall`, `goAway`
//!
//! Transkript-Fragmente werden gepuffert und bei `turnComplete` als finale
//! Transkripte ausgegeben.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use livegate_protocol::{MediaChunk, ToolResponse};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use super::{
    FunctionCall, SessionConfig, TranskriptRichtung, UpstreamConnector, UpstreamError,
    UpstreamEvent, UpstreamSession, EVENT_QUEUE_GROESSE,
};

/// Standard-Endpunkt der Gemini Live API
pub const STANDARD_ENDPUNKT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Close-Code fuer regulaeres Verbindungsende
const CLOSE_NORMAL: u16 = 1000;

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Baut Gemini-Live-Sitzungen auf
pub struct GeminiConnector {
    endpunkt: String,
}

impl GeminiConnector {
    pub fn neu(endpunkt: impl Into<String>) -> Self {
        Self {
            endpunkt: endpunkt.into(),
        }
    }
}

impl Default for GeminiConnector {
    fn default() -> Self {
        Self::neu(STANDARD_ENDPUNKT)
    }
}

#[async_trait]
impl UpstreamConnector for GeminiConnector {
    async fn connect(
        &self,
        config: SessionConfig,
    ) -> Result<(Arc<dyn UpstreamSession>, mpsc::Receiver<UpstreamEvent>), UpstreamError> {
        let url = format!("{}?key={}", self.endpunkt, config.api_key);
        let (ws, _antwort) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| UpstreamError::Verbindung(e.to_string()))?;
        let (mut schreiber, mut leser) = ws.split();

        schreiber
            .send(Message::Text(setup_nachricht(&config).to_string().into()))
            .await
            .map_err(|e| UpstreamError::Verbindung(e.to_string()))?;

        tracing::debug!(modell = %config.modell, stimme = %config.stimme, "Gemini-Setup gesendet");

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_GROESSE);
        let (ausgang_tx, mut ausgang_rx) = mpsc::channel::<Message>(64);
        let offen = Arc::new(AtomicBool::new(true));

        let _ = event_tx.send(UpstreamEvent::Opened).await;

        // Schreib-Task: einziger Besitzer der Sink-Haelfte
        tokio::spawn(async move {
            while let Some(nachricht) = ausgang_rx.recv().await {
                let schliessen = matches!(nachricht, Message::Close(_));
                if let Err(e) = schreiber.send(nachricht).await {
                    tracing::warn!(fehler = %e, "Senden an Gemini fehlgeschlagen");
                    break;
                }
                if schliessen {
                    break;
                }
            }
            let _ = schreiber.close().await;
        });

        // Lese-Task: uebersetzt Server-Nachrichten in UpstreamEvents
        let lese_offen = Arc::clone(&offen);
        tokio::spawn(async move {
            let mut puffer = TranskriptPuffer::default();
            let grund = loop {
                let ereignisse = match leser.next().await {
                    Some(Ok(Message::Text(text))) => nachricht_auswerten(&mut puffer, text.as_str()),
                    Some(Ok(Message::Binary(daten))) => match std::str::from_utf8(&daten) {
                        Ok(text) => nachricht_auswerten(&mut puffer, text),
                        Err(_) => {
                            tracing::debug!(laenge = daten.len(), "Binaere Gemini-Nachricht ohne UTF-8 ignoriert");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let (code, grund) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((CLOSE_NORMAL, String::new()));
                        if code != CLOSE_NORMAL {
                            let text = if grund.is_empty() {
                                format!("Upstream-Verbindung mit Code {code} geschlossen")
                            } else {
                                grund.clone()
                            };
                            let _ = event_tx.send(UpstreamEvent::Error(text)).await;
                        }
                        break if grund.is_empty() { "upstream_closed".to_string() } else { grund };
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        let _ = event_tx.send(UpstreamEvent::Error(e.to_string())).await;
                        break "upstream_error".to_string();
                    }
                    None => break "upstream_closed".to_string(),
                };

                for ereignis in ereignisse {
                    if event_tx.send(ereignis).await.is_err() {
                        // Niemand hoert mehr zu
                        lese_offen.store(false, Ordering::Relaxed);
                        return;
                    }
                }
            };

            lese_offen.store(false, Ordering::Relaxed);
            let _ = event_tx.send(UpstreamEvent::Closed { reason: grund }).await;
        });

        let sitzung: Arc<dyn UpstreamSession> = Arc::new(GeminiSession {
            ausgang: ausgang_tx,
            offen,
        });
        Ok((sitzung, event_rx))
    }
}

// ---------------------------------------------------------------------------
// Sitzung
// ---------------------------------------------------------------------------

struct GeminiSession {
    ausgang: mpsc::Sender<Message>,
    offen: Arc<AtomicBool>,
}

impl GeminiSession {
    async fn json_senden(&self, wert: Value) -> Result<(), UpstreamError> {
        if !self.is_open() {
            return Err(UpstreamError::Geschlossen);
        }
        self.ausgang
            .send(Message::Text(wert.to_string().into()))
            .await
            .map_err(|_| UpstreamError::Geschlossen)
    }
}

#[async_trait]
impl UpstreamSession for GeminiSession {
    async fn send_input(&self, chunks: Vec<MediaChunk>) -> Result<(), UpstreamError> {
        self.json_senden(json!({ "realtimeInput": { "mediaChunks": chunks } }))
            .await
    }

    async fn send_tool_response(&self, antworten: Vec<ToolResponse>) -> Result<(), UpstreamError> {
        self.json_senden(json!({ "toolResponse": { "functionResponses": antworten } }))
            .await
    }

    async fn send_context(&self, text: String) -> Result<(), UpstreamError> {
        self.json_senden(json!({
            "clientContent": {
                "turns": [{ "role": "user", "parts": [{ "text": text }] }],
                "turnComplete": false,
            }
        }))
        .await
    }

    async fn close(&self) {
        if self.offen.swap(false, Ordering::Relaxed) {
            let _ = self.ausgang.send(Message::Close(None)).await;
        }
    }

    fn is_open(&self) -> bool {
        self.offen.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Protokoll
// ---------------------------------------------------------------------------

/// Baut die `setup`-Nachricht
pub fn setup_nachricht(config: &SessionConfig) -> Value {
    let mut setup = json!({
        "model": config.modell,
        "generationConfig": {
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": config.stimme } },
                "languageCode": config.sprache,
            },
        },
        "systemInstruction": { "parts": [{ "text": config.system_anweisung }] },
        "inputAudioTranscription": {},
        "outputAudioTranscription": {},
    });
    if !config.werkzeuge.is_empty() {
        setup["tools"] = json!([{ "functionDeclarations": config.werkzeuge }]);
    }
    json!({ "setup": setup })
}

/// Sammelt Transkript-Fragmente bis zum Turn-Ende
#[derive(Debug, Default)]
pub struct TranskriptPuffer {
    eingabe: String,
    ausgabe: String,
}

impl TranskriptPuffer {
    fn anhaengen(&mut self, richtung: TranskriptRichtung, fragment: &str) {
        match richtung {
            TranskriptRichtung::Eingabe => self.eingabe.push_str(fragment),
            TranskriptRichtung::Ausgabe => self.ausgabe.push_str(fragment),
        }
    }

    /// Gibt die gesammelten, nicht-leeren Transkripte zurueck
    fn leeren(&mut self) -> Vec<(TranskriptRichtung, String)> {
        let mut fertig = Vec::new();
        for (richtung, puffer) in [
            (TranskriptRichtung::Eingabe, &mut self.eingabe),
            (TranskriptRichtung::Ausgabe, &mut self.ausgabe),
        ] {
            let text = std::mem::take(puffer);
            let text = text.trim();
            if !text.is_empty() {
                fertig.push((richtung, text.to_string()));
            }
        }
        fertig
    }
}

/// Uebersetzt eine Server-Nachricht in interne Ereignisse
pub fn nachricht_auswerten(puffer: &mut TranskriptPuffer, text: &str) -> Vec<UpstreamEvent> {
    let wert: Value = match serde_json::from_str(text) {
        Ok(w) => w,
        Err(e) => {
            tracing::debug!(fehler = %e, "Gemini-Nachricht ist kein JSON");
            return Vec::new();
        }
    };

    let mut ereignisse = Vec::new();

    if wert.get("setupComplete").is_some() {
        ereignisse.push(UpstreamEvent::SetupComplete);
    }

    if let Some(inhalt) = wert.get("serverContent") {
        for (richtung, zeiger) in [
            (TranskriptRichtung::Eingabe, "/inputTranscription/text"),
            (TranskriptRichtung::Ausgabe, "/outputTranscription/text"),
        ] {
            if let Some(fragment) = inhalt.pointer(zeiger).and_then(Value::as_str) {
                if !fragment.is_empty() {
                    puffer.anhaengen(richtung, fragment);
                    ereignisse.push(UpstreamEvent::Transcript {
                        richtung,
                        text: fragment.to_string(),
                        fertig: false,
                    });
                }
            }
        }

        if let Some(teile) = inhalt.pointer("/modelTurn/parts").and_then(Value::as_array) {
            for teil in teile {
                if let Some(text) = teil.get("text").and_then(Value::as_str) {
                    ereignisse.push(UpstreamEvent::TextPart(text.to_string()));
                }
                if let Some(inline) = teil.get("inlineData") {
                    let mime_type = inline.get("mimeType").and_then(Value::as_str).unwrap_or_default();
                    let data = inline.get("data").and_then(Value::as_str).unwrap_or_default();
                    if mime_type.starts_with("audio/") && !data.is_empty() {
                        ereignisse.push(UpstreamEvent::AudioPart {
                            data: data.to_string(),
                            mime_type: mime_type.to_string(),
                        });
                    }
                }
            }
        }

        if inhalt.get("interrupted").and_then(Value::as_bool) == Some(true) {
            tracing::debug!("Modellantwort vom Nutzer unterbrochen");
        }

        if inhalt.get("turnComplete").and_then(Value::as_bool) == Some(true) {
            for (richtung, text) in puffer.leeren() {
                ereignisse.push(UpstreamEvent::Transcript {
                    richtung,
                    text,
                    fertig: true,
                });
            }
            ereignisse.push(UpstreamEvent::TurnComplete);
        }
    }

    if let Some(aufrufe) = wert.pointer("/toolCall/functionCalls").and_then(Value::as_array) {
        let aufrufe: Vec<FunctionCall> = aufrufe
            .iter()
            .filter_map(|a| {
                Some(FunctionCall {
                    id: a.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
                    name: a.get("name")?.as_str()?.to_string(),
                    args: a.get("args").cloned().unwrap_or_else(|| json!({})),
                })
            })
            .collect();
        if !aufrufe.is_empty() {
            ereignisse.push(UpstreamEvent::ToolCall(aufrufe));
        }
    }

    if let Some(go_away) = wert.get("goAway") {
        let zeit_uebrig = go_away.get("timeLeft").cloned().unwrap_or_default();
        tracing::warn!(zeit_uebrig = %zeit_uebrig, "Gemini kuendigt Verbindungsende an");
    }

    ereignisse
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig {
            api_key: "geheim".into(),
            modell: "models/gemini-2.0-flash-live-001".into(),
            stimme: "Puck".into(),
            sprache: "de-DE".into(),
            system_anweisung: "Du bist ein Verkaufsassistent.".into(),
            werkzeuge: vec![json!({ "name": "get_current_time", "description": "Uhrzeit" })],
        }
    }

    #[test]
    fn setup_enthaelt_stimme_sprache_und_tools() {
        let setup = setup_nachricht(&config());
        assert_eq!(setup["setup"]["model"], "models/gemini-2.0-flash-live-001");
        assert_eq!(
            setup.pointer("/setup/generationConfig/speechConfig/voiceConfig/prebuiltVoiceConfig/voiceName"),
            Some(&json!("Puck"))
        );
        assert_eq!(
            setup.pointer("/setup/generationConfig/speechConfig/languageCode"),
            Some(&json!("de-DE"))
        );
        assert_eq!(
            setup.pointer("/setup/tools/0/functionDeclarations/0/name"),
            Some(&json!("get_current_time"))
        );
        assert!(setup["setup"].get("inputAudioTranscription").is_some());
        assert!(!setup.to_string().contains("geheim"));
    }

    #[test]
    fn setup_ohne_tools_laesst_feld_weg() {
        let mut cfg = config();
        cfg.werkzeuge.clear();
        assert!(setup_nachricht(&cfg)["setup"].get("tools").is_none());
    }

    #[test]
    fn setup_complete() {
        let mut puffer = TranskriptPuffer::default();
        let ereignisse = nachricht_auswerten(&mut puffer, r#"{"setupComplete":{}}"#);
        assert_eq!(ereignisse, vec![UpstreamEvent::SetupComplete]);
    }

    #[test]
    fn transkripte_werden_bis_turn_ende_gesammelt() {
        let mut puffer = TranskriptPuffer::default();
        let a = nachricht_auswerten(
            &mut puffer,
            r#"{"serverContent":{"inputTranscription":{"text":"Was kostet"}}}"#,
        );
        assert!(matches!(
            &a[0],
            UpstreamEvent::Transcript { richtung: TranskriptRichtung::Eingabe, fertig: false, .. }
        ));
        nachricht_auswerten(
            &mut puffer,
            r#"{"serverContent":{"inputTranscription":{"text":" das Premium-Paket?"}}}"#,
        );
        nachricht_auswerten(
            &mut puffer,
            r#"{"serverContent":{"outputTranscription":{"text":"49 Euro im Monat."}}}"#,
        );

        let ende = nachricht_auswerten(&mut puffer, r#"{"serverContent":{"turnComplete":true}}"#);
        assert_eq!(
            ende,
            vec![
                UpstreamEvent::Transcript {
                    richtung: TranskriptRichtung::Eingabe,
                    text: "Was kostet das Premium-Paket?".into(),
                    fertig: true,
                },
                UpstreamEvent::Transcript {
                    richtung: TranskriptRichtung::Ausgabe,
                    text: "49 Euro im Monat.".into(),
                    fertig: true,
                },
                UpstreamEvent::TurnComplete,
            ]
        );

        // Puffer ist danach leer
        let naechstes = nachricht_auswerten(&mut puffer, r#"{"serverContent":{"turnComplete":true}}"#);
        assert_eq!(naechstes, vec![UpstreamEvent::TurnComplete]);
    }

    #[test]
    fn model_turn_text_und_audio() {
        let mut puffer = TranskriptPuffer::default();
        let ereignisse = nachricht_auswerten(
            &mut puffer,
            r#"{"serverContent":{"modelTurn":{"parts":[
                {"text":"Hallo"},
                {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAAA"}},
                {"inlineData":{"mimeType":"image/png","data":"iVBO"}}
            ]}}}"#,
        );
        assert_eq!(
            ereignisse,
            vec![
                UpstreamEvent::TextPart("Hallo".into()),
                UpstreamEvent::AudioPart {
                    data: "AAAA".into(),
                    mime_type: "audio/pcm;rate=24000".into()
                },
            ]
        );
    }

    #[test]
    fn tool_call_ohne_namen_wird_verworfen() {
        let mut puffer = TranskriptPuffer::default();
        let ereignisse = nachricht_auswerten(
            &mut puffer,
            r#"{"toolCall":{"functionCalls":[
                {"id":"c1","name":"get_current_time","args":{}},
                {"id":"c2"}
            ]}}"#,
        );
        match &ereignisse[..] {
            [UpstreamEvent::ToolCall(aufrufe)] => {
                assert_eq!(aufrufe.len(), 1);
                assert_eq!(aufrufe[0].id, "c1");
                assert_eq!(aufrufe[0].name, "get_current_time");
            }
            andere => panic!("Erwartet ToolCall, erhalten {andere:?}"),
        }
    }

    #[test]
    fn kaputtes_json_ergibt_nichts() {
        let mut puffer = TranskriptPuffer::default();
        assert!(nachricht_auswerten(&mut puffer, "{kaputt").is_empty());
        assert!(nachricht_auswerten(&mut puffer, r#"{"goAway":{"timeLeft":"10s"}}"#).is_empty());
    }

    #[test]
    fn go_away_ohne_restzeit_wird_nur_geloggt() {
        let mut puffer = TranskriptPuffer::default();
        assert!(nachricht_auswerten(&mut puffer, r#"{"goAway":{}}"#).is_empty());
    }
}
