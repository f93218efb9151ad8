//! Fehlertypen fuer livegate-core
//!
//! Die anderen Crates haben eigene Fehler (`ProtocolError`, `GatewayError`,
//! `UpstreamError`); hier liegt nur, was beim Parsen der Kerntypen scheitert.

use thiserror::Error;

/// Result-Alias fuer livegate-core
pub type Result<T> = std::result::Result<T, LivegateError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LivegateError {
    #[error("Ungueltiger Wert fuer {feld}: {wert}")]
    UngueltigerWert { feld: &'static str, wert: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fehler_anzeige() {
        let e = LivegateError::UngueltigerWert {
            feld: "modality",
            wert: "radar".into(),
        };
        assert_eq!(e.to_string(), "Ungueltiger Wert fuer modality: radar");
    }
}
