//! Lokale Tools und der Tool-Call-Prozessor
//!
//! Ein Tool-Batch vom Upstream wird streng sequentiell abgearbeitet und
//! immer vollstaendig als *ein* `toolResponse` zurueckgegeben: N Aufrufe
//! ergeben N Antworten, auch wenn jedes einzelne Tool scheitert.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use livegate_core::{ConnectionId, SessionId};
use livegate_observability::GatewayMetrics;
use livegate_protocol::ToolResponse;
use serde_json::{json, Value};

use crate::collaborators::ContextStore;
use crate::upstream::{FunctionCall, UpstreamSession};

// ---------------------------------------------------------------------------
// Werkzeug-Trait
// ---------------------------------------------------------------------------

/// Kontext eines einzelnen Tool-Aufrufs
#[derive(Clone)]
pub struct WerkzeugKontext {
    pub connection_id: ConnectionId,
    pub session_id: SessionId,
    pub kontext_store: Arc<dyn ContextStore>,
}

/// Ein lokal ausfuehrbares Tool
#[async_trait]
pub trait Werkzeug: Send + Sync {
    fn name(&self) -> &'static str;

    fn beschreibung(&self) -> &'static str;

    /// JSON-Schema der Argumente
    fn parameter(&self) -> Value {
        json!({ "type": "OBJECT", "properties": {} })
    }

    async fn ausfuehren(&self, args: Value, kontext: &WerkzeugKontext) -> Result<Value, String>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Name -> Tool
#[derive(Default)]
pub struct ToolRegistry {
    werkzeuge: BTreeMap<String, Arc<dyn Werkzeug>>,
}

impl ToolRegistry {
    pub fn neu() -> Self {
        Self::default()
    }

    /// Registry mit den eingebauten Tools
    pub fn mit_standardwerkzeugen() -> Self {
        let mut registry = Self::neu();
        registry.registrieren(AktuelleZeit);
        registry.registrieren(SitzungsKontext);
        registry
    }

    pub fn registrieren(&mut self, werkzeug: impl Werkzeug + 'static) {
        let name = werkzeug.name().to_string();
        if self.werkzeuge.insert(name.clone(), Arc::new(werkzeug)).is_some() {
            tracing::warn!(tool = %name, "Tool ueberschrieben");
        }
    }

    pub fn finden(&self, name: &str) -> Option<Arc<dyn Werkzeug>> {
        self.werkzeuge.get(name).cloned()
    }

    /// Funktions-Deklarationen fuer das Sitzungs-Setup
    pub fn deklarationen(&self) -> Vec<Value> {
        self.werkzeuge
            .values()
            .map(|w| {
                json!({
                    "name": w.name(),
                    "description": w.beschreibung(),
                    "parameters": w.parameter(),
                })
            })
            .collect()
    }

    pub fn anzahl(&self) -> usize {
        self.werkzeuge.len()
    }
}

// ---------------------------------------------------------------------------
// Eingebaute Tools
// ---------------------------------------------------------------------------

/// `get_current_time`
pub struct AktuelleZeit;

#[async_trait]
impl Werkzeug for AktuelleZeit {
    fn name(&self) -> &'static str {
        "get_current_time"
    }

    fn beschreibung(&self) -> &'static str {
        "Liefert das aktuelle Datum und die Uhrzeit (UTC)"
    }

    async fn ausfuehren(&self, _args: Value, _kontext: &WerkzeugKontext) -> Result<Value, String> {
        let jetzt = chrono::Utc::now();
        Ok(json!({
            "utc": jetzt.to_rfc3339(),
            "unix_ms": jetzt.timestamp_millis(),
            "wochentag": jetzt.format("%A").to_string(),
        }))
    }
}

/// `get_session_context`: bisheriger Gespraechs- und Bildkontext
pub struct SitzungsKontext;

#[async_trait]
impl Werkzeug for SitzungsKontext {
    fn name(&self) -> &'static str {
        "get_session_context"
    }

    fn beschreibung(&self) -> &'static str {
        "Liefert die bisherigen Turns und visuellen Analysen dieser Sitzung"
    }

    async fn ausfuehren(&self, _args: Value, kontext: &WerkzeugKontext) -> Result<Value, String> {
        kontext
            .kontext_store
            .get_context(&kontext.session_id)
            .await
            .map_err(|e| e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Prozessor
// ---------------------------------------------------------------------------

/// Ergebnis eines Batches
#[derive(Debug, Clone)]
pub struct BatchErgebnis {
    /// `false` nur wenn der Batch nicht zurueckgesendet werden konnte
    pub handled: bool,
    pub antworten: Vec<ToolResponse>,
}

/// Fuehrt Tool-Batches aus und antwortet dem Upstream
pub struct ToolCallProcessor {
    werkzeuge: Arc<ToolRegistry>,
    kontext_store: Arc<dyn ContextStore>,
    metriken: GatewayMetrics,
}

impl ToolCallProcessor {
    pub fn neu(
        werkzeuge: Arc<ToolRegistry>,
        kontext_store: Arc<dyn ContextStore>,
        metriken: GatewayMetrics,
    ) -> Self {
        Self {
            werkzeuge,
            kontext_store,
            metriken,
        }
    }

    /// Verarbeitet einen Batch in Reihenfolge und sendet alle Antworten gesammelt
    pub async fn verarbeiten(
        &self,
        connection_id: ConnectionId,
        session_id: &SessionId,
        upstream: &Arc<dyn UpstreamSession>,
        aufrufe: Vec<FunctionCall>,
    ) -> BatchErgebnis {
        let kontext = WerkzeugKontext {
            connection_id,
            session_id: session_id.clone(),
            kontext_store: Arc::clone(&self.kontext_store),
        };

        let mut antworten = Vec::with_capacity(aufrufe.len());
        for aufruf in aufrufe {
            let response = match self.einzeln_ausfuehren(&aufruf, &kontext).await {
                Ok(data) => {
                    self.metriken.tool_calls_total.with_label_values(&["erfolg"]).inc();
                    self.aufzeichnen(&kontext.session_id, &aufruf, &data);
                    json!({ "success": true, "data": data })
                }
                Err(fehler) => {
                    self.metriken.tool_calls_total.with_label_values(&["fehler"]).inc();
                    tracing::warn!(
                        connection_id = %connection_id,
                        tool = %aufruf.name,
                        fehler = %fehler,
                        "Tool-Aufruf fehlgeschlagen"
                    );
                    json!({ "success": false, "error": fehler })
                }
            };
            antworten.push(ToolResponse {
                id: aufruf.id,
                name: aufruf.name,
                response,
            });
        }

        let handled = match upstream.send_tool_response(antworten.clone()).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    connection_id = %connection_id,
                    anzahl = antworten.len(),
                    fehler = %e,
                    "Tool-Batch konnte nicht gesendet werden"
                );
                false
            }
        };

        BatchErgebnis { handled, antworten }
    }

    async fn einzeln_ausfuehren(
        &self,
        aufruf: &FunctionCall,
        kontext: &WerkzeugKontext,
    ) -> Result<Value, String> {
        let Some(werkzeug) = self.werkzeuge.finden(&aufruf.name) else {
            return Err(format!("Unbekanntes Tool: {}", aufruf.name));
        };

        // Eigener Task, damit ein Panic im Tool den Batch nicht abbricht
        let args = aufruf.args.clone();
        let kontext = kontext.clone();
        match tokio::spawn(async move { werkzeug.ausfuehren(args, &kontext).await }).await {
            Ok(ergebnis) => ergebnis,
            Err(e) => Err(format!("Tool abgestuerzt: {e}")),
        }
    }

    /// Fire-and-forget: erfolgreiche Aufrufe an den Turn haengen
    fn aufzeichnen(&self, session_id: &SessionId, aufruf: &FunctionCall, ergebnis: &Value) {
        let store = Arc::clone(&self.kontext_store);
        let session_id = session_id.clone();
        let name = aufruf.name.clone();
        let args = aufruf.args.clone();
        let ergebnis = ergebnis.clone();
        tokio::spawn(async move {
            if let Err(e) = store
                .add_tool_call_to_turn(&session_id, &name, &args, &ergebnis)
                .await
            {
                tracing::debug!(session_id = %session_id, tool = %name, fehler = %e, "Tool-Aufruf nicht aufgezeichnet");
            }
        });
    }
}
