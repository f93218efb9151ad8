//! Externe Kollaborateure des Gateways
//!
//! Das Gateway kennt Verlauf, Kontext-Speicher, Orchestrierung und
//! Admin-Pruefung nur ueber diese Traits. Die Standard-Implementierungen
//! reichen fuer den Betrieb ohne weitere Dienste.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use livegate_core::{Modalitaet, SessionId};
use serde::Serialize;
use serde_json::{json, Value};

/// Maximale Eintraege pro Liste im Speicher-Store
const MAX_EINTRAEGE: usize = 200;

/// Wer hat gesprochen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Sprecher {
    Nutzer,
    Assistent,
    Visuell,
}

/// Aus einem Turn abgeleitete Nachricht fuer die Orchestrierung
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnNachricht {
    pub sprecher: Sprecher,
    pub text: String,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Laedt frueheren Gespraechskontext einer logischen Sitzung
#[async_trait]
pub trait HistoryLoader: Send + Sync {
    async fn laden(&self, session_id: &SessionId) -> Result<Option<String>>;
}

/// Multimodaler Kontext-Speicher
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Finaler Turn eines Sprechers
    async fn add_turn(&self, session_id: &SessionId, sprecher: Sprecher, text: &str) -> Result<()>;

    /// Analyse-Text einer visuellen Aufnahme
    async fn add_transcript(
        &self,
        session_id: &SessionId,
        modalitaet: Modalitaet,
        analyse: &str,
    ) -> Result<()>;

    /// Haengt einen erfolgreichen Tool-Aufruf an den letzten Turn
    async fn add_tool_call_to_turn(
        &self,
        session_id: &SessionId,
        name: &str,
        args: &Value,
        ergebnis: &Value,
    ) -> Result<()>;

    async fn get_context(&self, session_id: &SessionId) -> Result<Value>;
}

/// Nachgelagerte Orchestrierung (Stufen, Agenten)
#[async_trait]
pub trait OrchestrationNotifier: Send + Sync {
    /// Liefert optional Stufen-Metadaten fuer ein `stage_update`
    async fn synchronisieren(
        &self,
        session_id: &SessionId,
        nachrichten: &[TurnNachricht],
    ) -> Result<Option<Value>>;
}

/// Privilegien-Pruefung
#[async_trait]
pub trait AdminCheck: Send + Sync {
    async fn ist_admin(&self, session_id: &SessionId) -> bool;
}

// ---------------------------------------------------------------------------
// Standard-Implementierungen
// ---------------------------------------------------------------------------

/// Kein gespeicherter Verlauf
#[derive(Debug, Default)]
pub struct KeinVerlauf;

#[async_trait]
impl HistoryLoader for KeinVerlauf {
    async fn laden(&self, _session_id: &SessionId) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Orchestrierung deaktiviert
#[derive(Debug, Default)]
pub struct KeinOrchestrator;

#[async_trait]
impl OrchestrationNotifier for KeinOrchestrator {
    async fn synchronisieren(
        &self,
        _session_id: &SessionId,
        _nachrichten: &[TurnNachricht],
    ) -> Result<Option<Value>> {
        Ok(None)
    }
}

/// Admin-Pruefung gegen eine feste Liste von Sitzungs-IDs
#[derive(Debug, Default)]
pub struct AdminListe {
    sitzungen: HashSet<String>,
}

impl AdminListe {
    pub fn neu(sitzungen: impl IntoIterator<Item = String>) -> Self {
        Self {
            sitzungen: sitzungen.into_iter().collect(),
        }
    }
}

#[async_trait]
impl AdminCheck for AdminListe {
    async fn ist_admin(&self, session_id: &SessionId) -> bool {
        !session_id.ist_anonym() && self.sitzungen.contains(session_id.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
struct GespeicherterTurn {
    sprecher: Sprecher,
    text: String,
    zeit: String,
    tool_calls: Vec<Value>,
}

#[derive(Debug, Default)]
struct Kontext {
    turns: Vec<GespeicherterTurn>,
    visuell: Vec<Value>,
}

fn begrenzen<T>(liste: &mut Vec<T>) {
    if liste.len() > MAX_EINTRAEGE {
        let ueberschuss = liste.len() - MAX_EINTRAEGE;
        liste.drain(..ueberschuss);
    }
}

/// Kontext-Speicher im Arbeitsspeicher, pro logischer Sitzung
#[derive(Debug, Default)]
pub struct SpeicherKontextStore {
    eintraege: DashMap<SessionId, Kontext>,
}

impl SpeicherKontextStore {
    pub fn neu() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContextStore for SpeicherKontextStore {
    async fn add_turn(&self, session_id: &SessionId, sprecher: Sprecher, text: &str) -> Result<()> {
        let mut kontext = self.eintraege.entry(session_id.clone()).or_default();
        kontext.turns.push(GespeicherterTurn {
            sprecher,
            text: text.to_string(),
            zeit: chrono::Utc::now().to_rfc3339(),
            tool_calls: Vec::new(),
        });
        begrenzen(&mut kontext.turns);
        Ok(())
    }

    async fn add_transcript(
        &self,
        session_id: &SessionId,
        modalitaet: Modalitaet,
        analyse: &str,
    ) -> Result<()> {
        let mut kontext = self.eintraege.entry(session_id.clone()).or_default();
        kontext.visuell.push(json!({
            "modality": modalitaet.as_str(),
            "analysis": analyse,
            "zeit": chrono::Utc::now().to_rfc3339(),
        }));
        begrenzen(&mut kontext.visuell);
        Ok(())
    }

    async fn add_tool_call_to_turn(
        &self,
        session_id: &SessionId,
        name: &str,
        args: &Value,
        ergebnis: &Value,
    ) -> Result<()> {
        let mut kontext = self.eintraege.entry(session_id.clone()).or_default();
        let Some(turn) = kontext.turns.last_mut() else {
            anyhow::bail!("Kein Turn fuer Sitzung {session_id} vorhanden");
        };
        turn.tool_calls.push(json!({ "name": name, "args": args, "result": ergebnis }));
        Ok(())
    }

    async fn get_context(&self, session_id: &SessionId) -> Result<Value> {
        let wert = match self.eintraege.get(session_id) {
            Some(kontext) => json!({
                "session_id": session_id.as_str(),
                "turns": kontext.turns,
                "visual": kontext.visuell,
            }),
            None => json!({ "session_id": session_id.as_str(), "turns": [], "visual": [] }),
        };
        Ok(wert)
    }
}

// ---------------------------------------------------------------------------
// Buendel
// ---------------------------------------------------------------------------

/// Alle Kollaborateure, wie sie der GatewayState haelt
#[derive(Clone)]
pub struct Kollaborateure {
    pub verlauf: Arc<dyn HistoryLoader>,
    pub kontext: Arc<dyn ContextStore>,
    pub orchestrator: Arc<dyn OrchestrationNotifier>,
    pub admin: Arc<dyn AdminCheck>,
}

impl Kollaborateure {
    /// Standard-Buendel: kein Verlauf, Speicher-Store, keine Orchestrierung
    pub fn standard(admin_sitzungen: impl IntoIterator<Item = String>) -> Self {
        Self {
            verlauf: Arc::new(KeinVerlauf),
            kontext: Arc::new(SpeicherKontextStore::neu()),
            orchestrator: Arc::new(KeinOrchestrator),
            admin: Arc::new(AdminListe::neu(admin_sitzungen)),
        }
    }
}
