//! Kontext-Injektion: visueller Kontext (Bildschirm, Webcam) in die Sitzung
//!
//! Pro Modalitaet wird entprellt (Standard 1,5 s) und gedrosselt (Standard
//! 10 s zwischen zwei Injektionen). Beim Feuern wird der *aktuelle* Snapshot
//! neu gelesen. Das Bild geht ueber den Medienkanal, der Analyse-Text ueber
//! den Kontext-Seitenkanal: Rohtext im Medienkanal lehnt der Upstream ab.

use std::sync::Arc;
use std::time::Duration;

use livegate_core::{ConnectionId, Modalitaet};
use livegate_protocol::MediaChunk;
use serde_json::json;
use tokio::time::Instant;

use crate::registry::{Registry, Snapshot};
use crate::timers::{TimerArt, TimerSet};
use crate::upstream::UpstreamSession;

/// Phrasen, mit denen Nutzer auf sichtbare Inhalte verweisen
const AUSLOESER: &[&str] = &[
    "bildschirm",
    "siehst du",
    "sehen sie",
    "schau mal",
    "schauen sie",
    "kamera",
    "webcam",
    "auf dem bild",
    "was ich zeige",
    "screen",
    "can you see",
    "do you see",
    "look at",
    "see this",
    "camera",
    "what i'm showing",
];

/// Einstellungen der Injektion
#[derive(Debug, Clone)]
pub struct InjektionsKonfig {
    pub aktiviert: bool,
    pub entprellung: Duration,
    /// Mindestabstand zweier Injektionen derselben Modalitaet
    pub mindestabstand: Duration,
    /// Wie alt ein Snapshot fuer den Ausloeser-Pfad hoechstens sein darf
    pub visuell_aktuell: Duration,
}

impl Default for InjektionsKonfig {
    fn default() -> Self {
        Self {
            aktiviert: true,
            entprellung: Duration::from_millis(1500),
            mindestabstand: Duration::from_secs(10),
            visuell_aktuell: Duration::from_secs(30),
        }
    }
}

/// Ergebnis der Pruefung eines Snapshots
#[derive(Debug, PartialEq)]
pub enum Entscheidung {
    Senden { bild: String, analyse: String },
    Gedrosselt,
    OhneBild,
}

/// Prueft Drossel und Bild und vermerkt die Injektion vor dem Senden
pub fn entscheiden(snapshot: &mut Snapshot, jetzt: Instant, mindestabstand: Duration) -> Entscheidung {
    if let Some(letzte) = snapshot.last_injected {
        if jetzt.saturating_duration_since(letzte) < mindestabstand {
            return Entscheidung::Gedrosselt;
        }
    }
    let Some(bild) = snapshot.image_data.clone() else {
        return Entscheidung::OhneBild;
    };
    snapshot.last_injected = Some(jetzt);
    Entscheidung::Senden {
        bild,
        analyse: snapshot.analysis.clone(),
    }
}

/// Verweist der Text auf sichtbare Inhalte?
pub fn ausloeser_erkannt(text: &str) -> bool {
    let text = text.to_lowercase();
    AUSLOESER.iter().any(|a| text.contains(a))
}

/// Plant und fuehrt Injektionen aus
#[derive(Clone)]
pub struct KontextInjektor {
    registry: Arc<Registry>,
    konfig: InjektionsKonfig,
}

impl KontextInjektor {
    pub fn neu(registry: Arc<Registry>, konfig: InjektionsKonfig) -> Self {
        Self { registry, konfig }
    }

    pub fn konfig(&self) -> &InjektionsKonfig {
        &self.konfig
    }

    /// (Re)startet den Entprell-Timer der Modalitaet
    pub fn planen(&self, id: ConnectionId, modalitaet: Modalitaet) {
        if !self.konfig.aktiviert {
            tracing::debug!(connection_id = %id, modalitaet = %modalitaet, "Kontext-Injektion deaktiviert");
            return;
        }

        let timer_id = TimerSet::naechste_id();
        let injektor = self.clone();
        let art = TimerArt::Injektion(modalitaet);

        self.registry.mit_sitzung(id, move |record| {
            let epoche = record.epoche;
            let entprellung = injektor.konfig.entprellung;
            let task = tokio::spawn(async move {
                tokio::time::sleep(entprellung).await;
                injektor.feuern(id, epoche, modalitaet, timer_id).await;
            });
            record.timer.setzen(art, timer_id, task.abort_handle());
        });
    }

    async fn feuern(&self, id: ConnectionId, epoche: u64, modalitaet: Modalitaet, timer_id: u64) {
        let jetzt = Instant::now();
        let mindestabstand = self.konfig.mindestabstand;
        let vorbereitet = self
            .registry
            .mit_sitzung_der_epoche(id, epoche, |record| {
                if !record.timer.abgelaufen(TimerArt::Injektion(modalitaet), timer_id) {
                    return None;
                }
                let snapshot = record.snapshots.get_mut(&modalitaet)?;
                Some((
                    Arc::clone(&record.upstream),
                    entscheiden(snapshot, jetzt, mindestabstand),
                ))
            })
            .flatten();

        let Some((upstream, entscheidung)) = vorbereitet else {
            return;
        };

        match entscheidung {
            Entscheidung::Senden { bild, analyse } => {
                self.injizieren(id, modalitaet, upstream, bild, analyse).await;
            }
            Entscheidung::Gedrosselt => {
                tracing::debug!(connection_id = %id, modalitaet = %modalitaet, "Injektion gedrosselt");
            }
            Entscheidung::OhneBild => {
                tracing::debug!(connection_id = %id, modalitaet = %modalitaet, "Snapshot ohne Bild, keine Injektion");
            }
        }
    }

    /// Ausloeser-Pfad: finales Nutzer-Transkript verweist auf Sichtbares
    ///
    /// Sendet den juengsten, aktuellen und nicht gedrosselten Snapshot sofort.
    pub fn bei_nutzer_transkript(&self, id: ConnectionId, text: &str) {
        if !self.konfig.aktiviert || !ausloeser_erkannt(text) {
            return;
        }

        let jetzt = Instant::now();
        let konfig = self.konfig.clone();
        let vorbereitet = self
            .registry
            .mit_sitzung(id, |record| {
                let modalitaet = Modalitaet::ALLE
                    .into_iter()
                    .filter(|m| {
                        record.snapshots.get(m).is_some_and(|s| {
                            s.image_data.is_some()
                                && jetzt.saturating_duration_since(s.empfangen) <= konfig.visuell_aktuell
                        })
                    })
                    .max_by_key(|m| record.snapshots.get(m).map(|s| s.empfangen))?;
                let snapshot = record.snapshots.get_mut(&modalitaet)?;
                match entscheiden(snapshot, jetzt, konfig.mindestabstand) {
                    Entscheidung::Senden { bild, analyse } => {
                        Some((Arc::clone(&record.upstream), modalitaet, bild, analyse))
                    }
                    _ => None,
                }
            })
            .flatten();

        let Some((upstream, modalitaet, bild, analyse)) = vorbereitet else {
            return;
        };

        tracing::info!(connection_id = %id, modalitaet = %modalitaet, "Visueller Verweis erkannt, sende Snapshot");
        let injektor = self.clone();
        tokio::spawn(async move {
            injektor.injizieren(id, modalitaet, upstream, bild, analyse).await;
        });
    }

    async fn injizieren(
        &self,
        id: ConnectionId,
        modalitaet: Modalitaet,
        upstream: Arc<dyn UpstreamSession>,
        bild: String,
        analyse: String,
    ) {
        let chunk = MediaChunk {
            mime_type: "image/jpeg".to_string(),
            data: bild,
        };
        if let Err(e) = upstream.send_input(vec![chunk]).await {
            tracing::warn!(connection_id = %id, modalitaet = %modalitaet, fehler = %e, "Bild-Injektion fehlgeschlagen");
            return;
        }

        if !analyse.is_empty() {
            let text = format!("Visueller Kontext ({modalitaet}): {analyse}");
            if let Err(e) = upstream.send_context(text).await {
                tracing::warn!(connection_id = %id, modalitaet = %modalitaet, fehler = %e, "Kontext-Update fehlgeschlagen");
                return;
            }
        }

        self.registry.protokollieren(
            id,
            "kontext_injiziert",
            json!({ "modality": modalitaet.as_str(), "analyse_zeichen": analyse.len() }),
        );
        tracing::debug!(connection_id = %id, modalitaet = %modalitaet, "Visueller Kontext injiziert");
    }
}
