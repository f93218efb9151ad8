//! Szenario-Tests fuer das Gateway
//!
//! Alle Szenarien laufen gegen einen geskripteten Upstream
//! ([`FakeConnector`]) und mit pausierter Tokio-Uhr.

mod relay;
mod router;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use livegate_core::ConnectionId;
use livegate_observability::GatewayMetrics;
use livegate_protocol::{ErrorCode, MediaChunk, ServerMessage, ToolResponse};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};

use crate::collaborators::Kollaborateure;
use crate::connection;
use crate::dispatcher::MessageRouter;
use crate::outbound::{Ausgehend, ClientEmpfaenger};
use crate::state::{GatewayConfig, GatewayState};
use crate::tools::ToolRegistry;
use crate::upstream::{
    SessionConfig, UpstreamConnector, UpstreamError, UpstreamEvent, UpstreamSession,
    EVENT_QUEUE_GROESSE,
};

// ---------------------------------------------------------------------------
// Upstream-Attrappen
// ---------------------------------------------------------------------------

/// Upstream-Sitzung, die alles mitschreibt und nie antwortet
#[derive(Default)]
pub(crate) struct StummeSitzung {
    pub eingaben: Mutex<Vec<Vec<MediaChunk>>>,
    pub tool_antworten: Mutex<Vec<Vec<ToolResponse>>>,
    pub kontexte: Mutex<Vec<String>>,
    pub geschlossen: AtomicBool,
    pub senden_fehlschlagen: AtomicBool,
    /// `send_input` wartet auf `freigabe` (voller Upstream-Kanal)
    pub haengen: AtomicBool,
    pub freigabe: Notify,
}

impl StummeSitzung {
    fn pruefen(&self) -> Result<(), UpstreamError> {
        if self.senden_fehlschlagen.load(Ordering::Relaxed) {
            return Err(UpstreamError::Senden("Socket zu".into()));
        }
        if self.geschlossen.load(Ordering::Relaxed) {
            return Err(UpstreamError::Geschlossen);
        }
        Ok(())
    }

    pub fn eingaben_anzahl(&self) -> usize {
        self.eingaben.lock().unwrap().len()
    }

    pub fn ist_geschlossen(&self) -> bool {
        self.geschlossen.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl UpstreamSession for StummeSitzung {
    async fn send_input(&self, chunks: Vec<MediaChunk>) -> Result<(), UpstreamError> {
        if self.haengen.load(Ordering::SeqCst) {
            self.freigabe.notified().await;
        }
        self.pruefen()?;
        self.eingaben.lock().unwrap().push(chunks);
        Ok(())
    }

    async fn send_tool_response(&self, antworten: Vec<ToolResponse>) -> Result<(), UpstreamError> {
        self.pruefen()?;
        self.tool_antworten.lock().unwrap().push(antworten);
        Ok(())
    }

    async fn send_context(&self, text: String) -> Result<(), UpstreamError> {
        self.pruefen()?;
        self.kontexte.lock().unwrap().push(text);
        Ok(())
    }

    async fn close(&self) {
        self.geschlossen.store(true, Ordering::Relaxed);
    }

    fn is_open(&self) -> bool {
        !self.geschlossen.load(Ordering::Relaxed)
    }
}

/// Geskripteter Connector
#[derive(Default)]
pub(crate) struct FakeConnector {
    pub versuche: AtomicUsize,
    pub sitzungen: Mutex<Vec<Arc<StummeSitzung>>>,
    sender: Mutex<Vec<mpsc::Sender<UpstreamEvent>>>,
    pub letzte_config: Mutex<Option<SessionConfig>>,
    /// Kuenstliche Dauer des Verbindungsaufbaus
    pub verzoegerung: Mutex<Duration>,
    /// Wenn gesetzt, schlaegt `connect` mit diesem Text fehl
    pub fehler: Mutex<Option<String>>,
}

impl FakeConnector {
    pub fn mit_verzoegerung(verzoegerung: Duration) -> Self {
        let connector = Self::default();
        *connector.verzoegerung.lock().unwrap() = verzoegerung;
        connector
    }

    pub fn anzahl(&self) -> usize {
        self.versuche.load(Ordering::SeqCst)
    }

    /// Upstream-Sitzung Nummer `index` (in Aufbau-Reihenfolge)
    pub fn sitzung(&self, index: usize) -> Arc<StummeSitzung> {
        Arc::clone(&self.sitzungen.lock().unwrap()[index])
    }

    /// Schickt ein Ereignis in die Sitzung Nummer `index`
    pub async fn ereignis(&self, index: usize, ereignis: UpstreamEvent) {
        let sender = self.sender.lock().unwrap()[index].clone();
        let _ = sender.send(ereignis).await;
    }
}

#[async_trait]
impl UpstreamConnector for FakeConnector {
    async fn connect(
        &self,
        config: SessionConfig,
    ) -> Result<(Arc<dyn UpstreamSession>, mpsc::Receiver<UpstreamEvent>), UpstreamError> {
        self.versuche.fetch_add(1, Ordering::SeqCst);
        *self.letzte_config.lock().unwrap() = Some(config);

        let verzoegerung = *self.verzoegerung.lock().unwrap();
        if !verzoegerung.is_zero() {
            tokio::time::sleep(verzoegerung).await;
        }
        let fehler = self.fehler.lock().unwrap().clone();
        if let Some(fehler) = fehler {
            return Err(UpstreamError::Verbindung(fehler));
        }

        let sitzung = Arc::new(StummeSitzung::default());
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_GROESSE);
        let _ = tx.send(UpstreamEvent::Opened).await;
        self.sitzungen.lock().unwrap().push(Arc::clone(&sitzung));
        self.sender.lock().unwrap().push(tx);
        Ok((sitzung, rx))
    }
}

// ---------------------------------------------------------------------------
// Testumgebung
// ---------------------------------------------------------------------------

pub(crate) fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.upstream.api_key = Some("test-schluessel".into());
    config
}

pub(crate) struct Umgebung {
    pub state: Arc<GatewayState>,
    pub router: MessageRouter,
    pub connector: Arc<FakeConnector>,
}

impl Umgebung {
    pub fn neu() -> Self {
        Self::mit(test_config(), FakeConnector::default(), Kollaborateure::standard(Vec::new()))
    }

    pub fn mit_config(config: GatewayConfig) -> Self {
        Self::mit(config, FakeConnector::default(), Kollaborateure::standard(Vec::new()))
    }

    pub fn mit(config: GatewayConfig, connector: FakeConnector, kollaborateure: Kollaborateure) -> Self {
        let connector = Arc::new(connector);
        let state = GatewayState::neu(
            config,
            kollaborateure,
            connector.clone(),
            ToolRegistry::mit_standardwerkzeugen(),
            GatewayMetrics::neu().unwrap(),
        );
        Self {
            router: MessageRouter::neu(Arc::clone(&state)),
            state,
            connector,
        }
    }

    pub fn verbinden(&self) -> (ConnectionId, ClientEmpfaenger) {
        connection::initialisieren(&self.state)
    }

    pub async fn frame(&self, id: ConnectionId, frame: Value) {
        self.router.frame_verarbeiten(id, &frame.to_string()).await;
    }

    /// start + setupComplete der Sitzung `index`; danach ist die Verbindung bereit
    pub async fn bereit_machen(&self, id: ConnectionId, index: usize) {
        self.frame(id, json!({ "type": "start", "payload": { "sessionId": "lead-1" } }))
            .await;
        ruhen().await;
        self.connector.ereignis(index, UpstreamEvent::SetupComplete).await;
        ruhen().await;
        assert!(self.state.registry.ist_bereit(id), "Verbindung sollte bereit sein");
    }
}

/// Laesst alle anstehenden Tasks laufen (pausierte Uhr: 1 ms)
pub(crate) async fn ruhen() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Leert die Queues und liefert alle JSON-Frames
pub(crate) fn nachrichten(empfaenger: &mut ClientEmpfaenger) -> Vec<ServerMessage> {
    let mut alle = Vec::new();
    while let Some(ausgehend) = empfaenger.try_naechste() {
        if let Ausgehend::Nachricht(n) = ausgehend {
            alle.push(n);
        }
    }
    alle
}

pub(crate) fn fehlercodes(nachrichten: &[ServerMessage]) -> Vec<ErrorCode> {
    nachrichten
        .iter()
        .filter_map(|n| match n {
            ServerMessage::Error(e) => Some(e.code),
            _ => None,
        })
        .collect()
}

pub(crate) fn anzahl_typ(nachrichten: &[ServerMessage], typ: &str) -> usize {
    nachrichten.iter().filter(|n| n.typ() == typ).count()
}

pub(crate) fn audio_frame() -> Value {
    json!({
        "type": "user_audio",
        "payload": { "audioData": "AAAAAAAA", "mimeType": "audio/pcm;rate=16000" }
    })
}
