//! Upstream – Abstraktion des Streaming-KI-Backends
//!
//! Ein [`UpstreamConnector`] baut eine Sitzung auf und liefert zwei Dinge:
//! das Sende-Handle ([`UpstreamSession`]) und einen Ereignis-Kanal, den der
//! Sitzungs-Lebenszyklus in einer einzigen Schleife abarbeitet.

pub mod gemini;

use std::sync::Arc;

use async_trait::async_trait;
use livegate_protocol::{MediaChunk, ToolResponse};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

pub use gemini::GeminiConnector;

/// Puffergroesse des Ereignis-Kanals
pub const EVENT_QUEUE_GROESSE: usize = 256;

/// Fehler der Upstream-Verbindung
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Verbindungsaufbau fehlgeschlagen: {0}")]
    Verbindung(String),

    #[error("Senden fehlgeschlagen: {0}")]
    Senden(String),

    #[error("Upstream-Sitzung ist geschlossen")]
    Geschlossen,

    #[error("Serialisierung fehlgeschlagen: {0}")]
    Serialisierung(#[from] serde_json::Error),
}

/// Parameter fuer den Sitzungsaufbau
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub api_key: String,
    pub modell: String,
    pub stimme: String,
    pub sprache: String,
    pub system_anweisung: String,
    /// Funktions-Deklarationen der lokalen Tools
    pub werkzeuge: Vec<Value>,
}

/// Vom Backend angeforderter Funktionsaufruf
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// Richtung eines Transkripts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranskriptRichtung {
    /// Was der Nutzer gesagt hat
    Eingabe,
    /// Was das Modell gesagt hat
    Ausgabe,
}

/// Geschlossene Menge interner Upstream-Ereignisse
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    Opened,
    SetupComplete,
    Transcript {
        richtung: TranskriptRichtung,
        text: String,
        fertig: bool,
    },
    TextPart(String),
    AudioPart {
        data: String,
        mime_type: String,
    },
    ToolCall(Vec<FunctionCall>),
    TurnComplete,
    Error(String),
    Closed {
        reason: String,
    },
}

/// Sende-Seite einer offenen Upstream-Sitzung
#[async_trait]
pub trait UpstreamSession: Send + Sync {
    /// Echtzeit-Medien (Audio, Bild, Video)
    async fn send_input(&self, chunks: Vec<MediaChunk>) -> Result<(), UpstreamError>;

    /// Antworten auf Funktionsaufrufe, immer als ein Batch
    async fn send_tool_response(&self, antworten: Vec<ToolResponse>) -> Result<(), UpstreamError>;

    /// Kontext-Seitenkanal fuer Text (nicht ueber den Medienkanal)
    async fn send_context(&self, text: String) -> Result<(), UpstreamError>;

    async fn close(&self);

    fn is_open(&self) -> bool;
}

/// Baut Upstream-Sitzungen auf
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(
        &self,
        config: SessionConfig,
    ) -> Result<(Arc<dyn UpstreamSession>, mpsc::Receiver<UpstreamEvent>), UpstreamError>;
}
