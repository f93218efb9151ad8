//! Sitzungs-Log: eine Datei pro Verbindung mit Lebenszyklus-Ereignissen
//!
//! Format: eine JSON-Zeile pro Ereignis (`ts`, `ereignis`, `details`).
//! Das Oeffnen passiert asynchron nach dem Verbindungsaufbau, Schreiben
//! laeuft ueber einen eigenen Task und blockiert nie den Aufrufer.

use std::path::{Path, PathBuf};

use livegate_core::ConnectionId;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

/// Handle auf das Log einer Verbindung
#[derive(Clone, Debug)]
pub struct SitzungsLogger {
    tx: mpsc::UnboundedSender<String>,
    pfad: PathBuf,
}

impl SitzungsLogger {
    /// Oeffnet `<verzeichnis>/<connection_id>.log` zum Anhaengen
    ///
    /// Der Schreib-Task endet, sobald alle Handles verworfen sind.
    pub async fn oeffnen(verzeichnis: &Path, id: ConnectionId) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(verzeichnis).await?;
        let pfad = verzeichnis.join(format!("{}.log", id.inner()));
        let mut datei = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&pfad)
            .await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let task_pfad = pfad.clone();
        tokio::spawn(async move {
            while let Some(mut zeile) = rx.recv().await {
                zeile.push('\n');
                if let Err(e) = datei.write_all(zeile.as_bytes()).await {
                    tracing::warn!(pfad = %task_pfad.display(), fehler = %e, "Sitzungs-Log nicht beschreibbar");
                    break;
                }
            }
            let _ = datei.flush().await;
        });

        Ok(Self { tx, pfad })
    }

    /// Haengt ein Ereignis an
    pub fn schreiben(&self, ereignis: &str, details: Value) {
        let zeile = json!({
            "ts": chrono::Utc::now().to_rfc3339(),
            "ereignis": ereignis,
            "details": details,
        });
        let _ = self.tx.send(zeile.to_string());
    }

    pub fn pfad(&self) -> &Path {
        &self.pfad
    }
}
