//! livegate-protocol – Wire-Protokoll-Definitionen
//!
//! Jede WebSocket-Textnachricht traegt genau ein Frame im Umschlag
//! `{ "type": ..., "payload": {...} }`.
//!
//! - [`inbound`]: Client -> Gateway (`start`, `user_audio`, `REALTIME_INPUT`, ...)
//! - [`control`]: Gateway -> Client (`connected`, `session_ready`, `error`, ...)
//! - [`wire`]: Umschlag, Frame-Limits und Heartbeat-Schnellpfad

pub mod control;
pub mod error;
pub mod inbound;
pub mod wire;

pub use control::{ErrorCode, ErrorResponse, ServerMessage, ToolCallPayload, TranscriptPayload, TurnGrund};
pub use error::ProtocolError;
pub use inbound::{
    ClientMessage, ContextUpdatePayload, MediaChunk, RealtimeInputPayload, StartPayload,
    ToolResponse, ToolResultPayload, UserAudioPayload,
};
pub use wire::{ist_ping, Envelope, MAX_FRAME_BYTES};
