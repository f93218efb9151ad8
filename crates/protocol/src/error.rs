//! Fehlertypen beim Dekodieren eingehender Frames

use thiserror::Error;

/// Protokollfehler – das Frame wird verworfen, die Verbindung bleibt bestehen
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Kein gueltiges JSON oder kein Umschlag
    #[error("Ungueltiges JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Unbekannter Nachrichtentyp
    #[error("Unbekannter Nachrichtentyp: {0}")]
    UnbekannterTyp(String),

    /// Typ verlangt einen Payload, der fehlt
    #[error("Payload fehlt fuer '{0}'")]
    PayloadFehlt(&'static str),

    /// Payload passt nicht zum Typ
    #[error("Ungueltiger Payload fuer '{typ}': {fehler}")]
    UngueltigerPayload {
        typ: &'static str,
        fehler: serde_json::Error,
    },

    /// Frame ueberschreitet die maximale Groesse
    #[error("Frame zu gross: {laenge} Bytes (max {max})")]
    FrameZuGross { laenge: usize, max: usize },
}
