//! Wire-Format: ein JSON-Umschlag pro WebSocket-Textnachricht
//!
//! ```text
//! { "type": "<typ>", "payload": { ... } }
//! ```
//!
//! Heartbeat-Pings werden vor dem eigentlichen Parsen per
//! [`ist_ping`] erkannt, damit sie nie hinter anderer Arbeit warten.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximale Frame-Groesse (8 MB – Bilder kommen Base64-kodiert)
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Frames oberhalb dieser Laenge koennen kein Ping sein
const PING_MAX_LAENGE: usize = 128;

/// Generischer Umschlag aller eingehenden Frames
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default)]
    pub payload: Option<Value>,
}

#[derive(Deserialize)]
struct NurTyp<'a> {
    #[serde(rename = "type", borrow)]
    typ: &'a str,
}

/// Schnellpfad: ist dieses Frame ein Heartbeat-Ping?
///
/// Zuerst ein strukturierter Vergleich auf `{"type":"ping"}`, als Fallback
/// ein roher Substring-Vergleich fuer Clients mit abweichender Formatierung.
pub fn ist_ping(text: &str) -> bool {
    if text.len() > PING_MAX_LAENGE || !text.contains("ping") {
        return false;
    }
    match serde_json::from_str::<NurTyp<'_>>(text) {
        Ok(nur_typ) => nur_typ.typ == "ping",
        Err(_) => {
            let kompakt: String = text.chars().filter(|c| !c.is_whitespace()).collect();
            kompakt.contains(r#""type":"ping""#)
        }
    }
}
