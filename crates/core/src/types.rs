//! Gemeinsame Identifikationstypen fuer livegate
//!
//! IDs verwenden das Newtype-Pattern um Verwechslungen zwischen
//! Verbindungs- und Sitzungs-Kennungen zur Compilezeit auszuschliessen.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::LivegateError;

/// Eindeutige Verbindungs-ID (opak fuer Clients)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Erstellt eine neue zufaellige ConnectionId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Gibt die innere UUID zurueck
    pub fn inner(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn:{}", self.0)
    }
}

/// Logische Sitzungs-ID, vom Client vergeben
///
/// Ohne Angabe des Clients gilt der Platzhalter `anonymous`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Platzhalter fuer Sitzungen ohne logische ID
    pub const ANONYM: &'static str = "anonymous";

    /// Erstellt eine SessionId; leere Werte werden zum Platzhalter
    pub fn neu(wert: impl Into<String>) -> Self {
        let wert = wert.into();
        let wert = wert.trim();
        if wert.is_empty() {
            Self::anonym()
        } else {
            Self(wert.to_string())
        }
    }

    /// Der `anonymous`-Platzhalter
    pub fn anonym() -> Self {
        Self(Self::ANONYM.to_string())
    }

    pub fn ist_anonym(&self) -> bool {
        self.0 == Self::ANONYM
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::anonym()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Visuelle Kontextquelle eines Snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modalitaet {
    Screen,
    Webcam,
}

impl Modalitaet {
    pub const ALLE: [Modalitaet; 2] = [Modalitaet::Screen, Modalitaet::Webcam];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Screen => "screen",
            Self::Webcam => "webcam",
        }
    }
}

impl std::fmt::Display for Modalitaet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Modalitaet {
    type Err = LivegateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "screen" => Ok(Self::Screen),
            "webcam" | "camera" => Ok(Self::Webcam),
            _ => Err(LivegateError::UngueltigerWert {
                feld: "modality",
                wert: s.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_eindeutig() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b, "Zwei neue ConnectionIds muessen verschieden sein");
    }

    #[test]
    fn connection_id_display() {
        let id = ConnectionId(Uuid::nil());
        assert!(id.to_string().starts_with("conn:"));
    }

    #[test]
    fn leere_session_id_wird_anonym() {
        assert!(SessionId::neu("   ").ist_anonym());
        assert!(SessionId::default().ist_anonym());
        assert_eq!(SessionId::neu(" lead-42 ").as_str(), "lead-42");
    }

    #[test]
    fn session_id_serialisiert_als_string() {
        let json = serde_json::to_string(&SessionId::neu("abc")).unwrap();
        assert_eq!(json, "\"abc\"");
    }

    #[test]
    fn modalitaet_parsen() {
        assert_eq!("screen".parse::<Modalitaet>().unwrap(), Modalitaet::Screen);
        assert_eq!("Webcam".parse::<Modalitaet>().unwrap(), Modalitaet::Webcam);
        assert!("radar".parse::<Modalitaet>().is_err());
    }
}
