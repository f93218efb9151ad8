//! livegate-gateway – Verbindungs- und Sitzungs-Lebenszyklus
//!
//! Verbindet WebSocket-Clients mit Sitzungen auf einem Streaming-KI-Backend.
//! Transport-unabhaengig: der Server-Crate liefert Text-Frames an den
//! [`dispatcher::MessageRouter`] und liest ausgehende Frames aus dem
//! [`outbound::ClientEmpfaenger`] einer Verbindung.
//!
//! ## Architektur
//! ```text
//! Transport -> MessageRouter -> session (start/stop)
//!                            -> relay   (Audio, Medien, Tool-Ergebnisse, Kontext)
//!
//! Upstream-Ereignisse -> session::ereignisschleife -> ClientSender
//! ```
//!
//! Geteilter Zustand liegt ausschliesslich in der [`registry::Registry`]
//! (zwei DashMaps, per Verbindungs-ID adressiert).

pub mod collaborators;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod injection;
pub mod outbound;
pub mod rate_limit;
pub mod registry;
pub mod relay;
pub mod session;
pub mod session_log;
pub mod state;
pub mod timers;
pub mod tools;
pub mod turn_detector;
pub mod upstream;

#[cfg(test)]
mod tests;

pub use dispatcher::{FrameQueue, MessageRouter};
pub use error::{FehlerKategorie, GatewayError, GatewayResult};
pub use outbound::{Ausgehend, ClientEmpfaenger, ClientSender};
pub use registry::Registry;
pub use state::{GatewayConfig, GatewayState, UpstreamEinstellungen};
