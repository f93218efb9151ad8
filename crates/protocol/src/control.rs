//! Ausgehende Nachrichten (Gateway -> Client)
//!
//! Alle Frames ausser `session_ready` verwenden den Umschlag
//! `{ "type": ..., "payload": {...} }`. `session_ready` wird aus
//! Kompatibilitaetsgruenden flach gesendet, siehe [`ServerMessage::to_json`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::inbound::ToolResponse;

// ---------------------------------------------------------------------------
// Fehler-Codes
// ---------------------------------------------------------------------------

/// Standardisierte Fehler-Codes fuer `error`-Frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Zustand
    LiveNotReady,
    NoActiveSession,
    RateLimitExceeded,
    // Eingabe
    InvalidMessage,
    // Konfiguration
    MissingCredential,
    InvalidConfig,
    // Upstream
    ApiKeyInvalid,
    QuotaExceeded,
    UpstreamTimeout,
    CredentialExpired,
    UpstreamError,
    // Tools
    ToolCallFailed,
    // Allgemein
    InternalError,
}

impl ErrorCode {
    /// Wire-Name (identisch zur serde-Darstellung)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LiveNotReady => "LIVE_NOT_READY",
            Self::NoActiveSession => "NO_ACTIVE_SESSION",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::MissingCredential => "MISSING_CREDENTIAL",
            Self::InvalidConfig => "INVALID_CONFIG",
            Self::ApiKeyInvalid => "API_KEY_INVALID",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            Self::CredentialExpired => "CREDENTIAL_EXPIRED",
            Self::UpstreamError => "UPSTREAM_ERROR",
            Self::ToolCallFailed => "TOOL_CALL_FAILED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Inhalt eines `error`-Frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
    pub code: ErrorCode,
    /// Sekunden bis zum Ende des Rate-Limit-Fensters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
}

/// Teil- oder End-Transkript
///
/// `isFinal` und `final` tragen denselben Wert; aeltere Clients lesen nur `final`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptPayload {
    pub text: String,
    pub is_final: bool,
    #[serde(rename = "final")]
    pub final_: bool,
}

impl TranscriptPayload {
    pub fn neu(text: impl Into<String>, fertig: bool) -> Self {
        Self {
            text: text.into(),
            is_final: fertig,
            final_: fertig,
        }
    }
}

/// Ergebnis serverseitig ausgefuehrter Tools
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolCallPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responses: Option<Vec<ToolResponse>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Grund eines `turn_complete`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnGrund {
    /// Signal des Upstream-Backends
    Upstream,
    /// Synthetisch nach Stille
    TimeoutSilence,
}

// ---------------------------------------------------------------------------
// ServerMessage
// ---------------------------------------------------------------------------

/// Alle ausgehenden Nachrichtentypen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    Connected {
        connection_id: String,
    },
    StartAck {
        session_id: String,
    },
    SessionStarted {
        session_id: String,
    },
    SetupComplete,
    SessionReady {
        session_id: String,
        timestamp: i64,
    },
    InputTranscript(TranscriptPayload),
    OutputTranscript(TranscriptPayload),
    Text {
        content: String,
    },
    Audio {
        audio_data: String,
        mime_type: String,
    },
    TurnComplete {
        reason: TurnGrund,
    },
    ToolCall(ToolCallPayload),
    StageUpdate(Value),
    Error(ErrorResponse),
    Heartbeat {
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
    SessionClosed {
        reason: String,
    },
}

impl ServerMessage {
    /// Fehler-Frame erstellen
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorResponse {
            message: message.into(),
            code,
            remaining: None,
        })
    }

    /// Rate-Limit-Fehler mit Restzeit
    pub fn rate_limit(message: impl Into<String>, remaining_secs: u64) -> Self {
        Self::Error(ErrorResponse {
            message: message.into(),
            code: ErrorCode::RateLimitExceeded,
            remaining: Some(remaining_secs),
        })
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: jetzt_ms(),
        }
    }

    pub fn heartbeat() -> Self {
        Self::Heartbeat {
            timestamp: jetzt_ms(),
        }
    }

    pub fn session_ready(session_id: impl Into<String>) -> Self {
        Self::SessionReady {
            session_id: session_id.into(),
            timestamp: jetzt_ms(),
        }
    }

    pub fn turn_complete(reason: TurnGrund) -> Self {
        Self::TurnComplete { reason }
    }

    /// Wire-Name des Typs (fuer Logs und Metriken)
    pub fn typ(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::StartAck { .. } => "start_ack",
            Self::SessionStarted { .. } => "session_started",
            Self::SetupComplete => "setup_complete",
            Self::SessionReady { .. } => "session_ready",
            Self::InputTranscript(_) => "input_transcript",
            Self::OutputTranscript(_) => "output_transcript",
            Self::Text { .. } => "text",
            Self::Audio { .. } => "audio",
            Self::TurnComplete { .. } => "turn_complete",
            Self::ToolCall(_) => "tool_call",
            Self::StageUpdate(_) => "stage_update",
            Self::Error(_) => "error",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Pong { .. } => "pong",
            Self::SessionClosed { .. } => "session_closed",
        }
    }

    /// Serialisiert das Frame fuer die Leitung
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            // Flaches Format ohne Payload-Umschlag
            Self::SessionReady {
                session_id,
                timestamp,
            } => serde_json::to_string(&json!({
                "type": "session_ready",
                "sessionId": session_id,
                "timestamp": timestamp,
            })),
            andere => serde_json::to_string(andere),
        }
    }
}

fn jetzt_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
