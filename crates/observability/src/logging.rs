//! Logging fuer livegate ueber tracing-subscriber
//!
//! Die Umgebung schlaegt die Config-Datei:
//! - `LG_LOG_LEVEL`: EnvFilter-Direktive (z.B. `info,livegate_gateway=debug`)
//! - `LG_LOG_FORMAT`: `text` oder `json`
//!
//! Im JSON-Format steht der aktuelle Span in jeder Zeile, damit traegt jedes
//! Ereignis einer Verbindung die `connection_id` des Spans `verbindung`.

use tracing_subscriber::{fmt, EnvFilter};

pub const LEVEL_VARIABLE: &str = "LG_LOG_LEVEL";
pub const FORMAT_VARIABLE: &str = "LG_LOG_FORMAT";

/// Ausgabeformat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    pub fn parsen(wert: &str) -> Option<Self> {
        match wert {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Wirksame Log-Einstellung nach Abgleich von Umgebung und Config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogAuswahl {
    pub filter: String,
    pub format: LogFormat,
}

impl LogAuswahl {
    /// `umgebung` liefert den Wert einer Umgebungsvariable
    ///
    /// Leere Variablen zaehlen als nicht gesetzt, ein unbekanntes Format in
    /// der Umgebung faellt auf das der Config zurueck.
    pub fn bestimmen(level: &str, format: &str, umgebung: impl Fn(&str) -> Option<String>) -> Self {
        let gesetzt = |name: &str| umgebung(name).filter(|w| !w.trim().is_empty());

        let filter = gesetzt(LEVEL_VARIABLE).unwrap_or_else(|| level.to_string());
        let format = gesetzt(FORMAT_VARIABLE)
            .and_then(|w| LogFormat::parsen(&w))
            .or_else(|| LogFormat::parsen(format))
            .unwrap_or(LogFormat::Text);

        Self { filter, format }
    }
}

/// Initialisiert den globalen Subscriber
pub fn logging_initialisieren(level: &str, format: &str) {
    let auswahl = LogAuswahl::bestimmen(level, format, |name| std::env::var(name).ok());
    let filter = EnvFilter::try_new(&auswahl.filter).unwrap_or_else(|_| EnvFilter::new("info"));

    match auswahl.format {
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_current_span(true)
                .with_span_list(false)
                .init();
        }
        LogFormat::Text => {
            fmt().with_env_filter(filter).with_target(true).compact().init();
        }
    }
}

/// Gueltiger Wert fuer `[logging] level`?
pub fn log_level_gueltig(level: &str) -> bool {
    matches!(level, "trace" | "debug" | "info" | "warn" | "error")
}

/// Gueltiger Wert fuer `[logging] format`?
pub fn log_format_gueltig(format: &str) -> bool {
    LogFormat::parsen(format).is_some()
}
