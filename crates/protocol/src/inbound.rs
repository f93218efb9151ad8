//! Eingehende Nachrichten (Client -> Gateway)
//!
//! Dekodierung in zwei Schritten: erst der Umschlag `{type, payload}`, dann
//! der typspezifische Payload. So laesst sich ein unbekannter Typ sauber von
//! einem kaputten Payload unterscheiden.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::wire::{Envelope, MAX_FRAME_BYTES};

/// Standard-MIME-Typ fuer Mikrofon-Audio (16 kHz PCM)
pub const STANDARD_AUDIO_MIME: &str = "audio/pcm;rate=16000";

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Sitzung starten
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload {
    #[serde(default)]
    pub language_code: Option<String>,
    #[serde(default)]
    pub voice_name: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Freier Kontext des Clients (Text oder Objekt)
    #[serde(default)]
    pub user_context: Option<Value>,
}

impl StartPayload {
    /// Nutzerkontext als Text fuer die Systemanweisung
    pub fn user_context_text(&self) -> Option<String> {
        match self.user_context.as_ref()? {
            Value::Null => None,
            Value::String(s) if s.trim().is_empty() => None,
            Value::String(s) => Some(s.trim().to_string()),
            andere => Some(andere.to_string()),
        }
    }
}

/// Einzelner Mikrofon-Chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAudioPayload {
    /// Base64-kodierte Audiodaten
    pub audio_data: String,
    #[serde(default = "standard_audio_mime")]
    pub mime_type: String,
}

fn standard_audio_mime() -> String {
    STANDARD_AUDIO_MIME.to_string()
}

/// Antwort auf einen vom Client ausgefuehrten Tool-Aufruf
///
/// Wird auch ausgehend im `tool_call`-Frame verwendet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub response: Value,
}

/// Ergebnisse client-seitiger Tools
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultPayload {
    pub responses: Vec<ToolResponse>,
}

/// Ein Medien-Chunk (Audio, Bild oder Video)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    /// Base64-kodierte Daten
    pub data: String,
}

impl MediaChunk {
    pub fn ist_audio(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }

    pub fn ist_bild_oder_video(&self) -> bool {
        self.mime_type.starts_with("image/") || self.mime_type.starts_with("video/")
    }
}

/// Gebuendelte Echtzeit-Eingaben
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeInputPayload {
    pub chunks: Vec<MediaChunk>,
}

/// Neuer visueller Kontext (Bildschirm oder Webcam)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextUpdatePayload {
    pub modality: String,
    #[serde(default)]
    pub analysis: String,
    /// Base64-kodiertes JPEG
    #[serde(default)]
    pub image_data: Option<String>,
    /// Unix-Timestamp in Millisekunden
    #[serde(default)]
    pub captured_at: Option<i64>,
}

// ---------------------------------------------------------------------------
// ClientMessage
// ---------------------------------------------------------------------------

/// Alle eingehenden Nachrichtentypen
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Start(StartPayload),
    Stop,
    UserAudio(UserAudioPayload),
    ToolResult(ToolResultPayload),
    RealtimeInput(RealtimeInputPayload),
    ContextUpdate(ContextUpdatePayload),
    HeartbeatAck,
    Ping,
}

impl ClientMessage {
    /// Dekodiert ein Text-Frame
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        if text.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameZuGross {
                laenge: text.len(),
                max: MAX_FRAME_BYTES,
            });
        }
        let umschlag: Envelope = serde_json::from_str(text)?;
        Self::aus_umschlag(umschlag)
    }

    /// Interpretiert einen bereits geparsten Umschlag
    pub fn aus_umschlag(umschlag: Envelope) -> Result<Self, ProtocolError> {
        let Envelope { typ, payload } = umschlag;
        match typ.as_str() {
            "start" => {
                // Alle Felder optional – fehlender Payload ist erlaubt
                let payload = payload.unwrap_or_else(|| Value::Object(Default::default()));
                Ok(Self::Start(payload_lesen("start", Some(payload))?))
            }
            "stop" => Ok(Self::Stop),
            "user_audio" => Ok(Self::UserAudio(payload_lesen("user_audio", payload)?)),
            "TOOL_RESULT" => Ok(Self::ToolResult(payload_lesen("TOOL_RESULT", payload)?)),
            "REALTIME_INPUT" => Ok(Self::RealtimeInput(payload_lesen(
                "REALTIME_INPUT",
                payload,
            )?)),
            "CONTEXT_UPDATE" => Ok(Self::ContextUpdate(payload_lesen(
                "CONTEXT_UPDATE",
                payload,
            )?)),
            "heartbeat_ack" => Ok(Self::HeartbeatAck),
            "ping" => Ok(Self::Ping),
            _ => Err(ProtocolError::UnbekannterTyp(typ)),
        }
    }

    /// Wire-Name des Typs (fuer Logs und Metriken)
    pub fn typ(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::Stop => "stop",
            Self::UserAudio(_) => "user_audio",
            Self::ToolResult(_) => "TOOL_RESULT",
            Self::RealtimeInput(_) => "REALTIME_INPUT",
            Self::ContextUpdate(_) => "CONTEXT_UPDATE",
            Self::HeartbeatAck => "heartbeat_ack",
            Self::Ping => "ping",
        }
    }
}

fn payload_lesen<T: DeserializeOwned>(
    typ: &'static str,
    payload: Option<Value>,
) -> Result<T, ProtocolError> {
    let payload = payload.ok_or(ProtocolError::PayloadFehlt(typ))?;
    serde_json::from_value(payload).map_err(|fehler| ProtocolError::UngueltigerPayload { typ, fehler })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
