//! Message-Router – dekodiert Frames und routet sie an die Handler
//!
//! Pro Verbindung werden Frames in Ankunftsreihenfolge verarbeitet.
//!
//! ## Ablauf eines Frames
//! 1. Heartbeat-Schnellpfad (`ping` -> `pong` ueber die Prioritaetsspur),
//!    ohne Rate-Limit und ohne Parsen des ganzen Umschlags
//! 2. Dekodieren; kaputte oder unbekannte Frames werden geloggt und verworfen
//! 3. Genau ein Handler pro Typ
//! 4. Handler-Fehler werden zu `error`-Frames; die Verbindung bleibt offen
//!
//! Der Transport reicht Frames ueber eine [`FrameQueue`] herein: Pings
//! beantwortet sie sofort im Lese-Loop, alle anderen Frames arbeitet ein
//! eigener Task der Reihe nach ab. Ein Handler, der auf den Upstream wartet,
//! haelt so weder Pongs noch den Lese-Loop auf.

use std::sync::Arc;
use std::time::Duration;

use livegate_core::ConnectionId;
use livegate_protocol::{ist_ping, ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{GatewayError, GatewayResult};
use crate::outbound::Ausgehend;
use crate::rate_limit::LimitKlasse;
use crate::relay;
use crate::session;
use crate::state::GatewayState;

/// Kapazitaet der Arbeits-Queue einer Verbindung
pub const FRAME_QUEUE_GROESSE: usize = 256;

/// Zentraler Router fuer eingehende Frames
#[derive(Clone)]
pub struct MessageRouter {
    state: Arc<GatewayState>,
}

impl MessageRouter {
    pub fn neu(state: Arc<GatewayState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    /// Startet den Arbeits-Task einer Verbindung
    pub fn frame_queue(&self, id: ConnectionId) -> FrameQueue {
        let (tx, mut rx) = mpsc::channel::<String>(FRAME_QUEUE_GROESSE);
        let ende = CancellationToken::new();

        let router = self.clone();
        let task_ende = ende.clone();
        let arbeiter = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = task_ende.cancelled() => break,
                    text = rx.recv() => match text {
                        Some(text) => router.frame_verarbeiten(id, &text).await,
                        None => break,
                    },
                }
            }
        });

        FrameQueue {
            router: self.clone(),
            id,
            tx,
            ende,
            arbeiter,
        }
    }

    /// Verarbeitet ein Text-Frame vollstaendig
    pub async fn frame_verarbeiten(&self, id: ConnectionId, text: &str) {
        if ist_ping(text) {
            self.pong_senden(id);
            return;
        }

        let nachricht = match ClientMessage::decode(text) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(connection_id = %id, fehler = %e, laenge = text.len(), "Frame verworfen");
                return;
            }
        };

        let typ = nachricht.typ();
        self.state
            .metriken
            .frames_total
            .with_label_values(&[typ])
            .inc();
        tracing::trace!(connection_id = %id, typ, "Frame empfangen");

        if let Err(fehler) = self.dispatch(id, nachricht).await {
            self.fehler_melden(id, typ, fehler);
        }
    }

    async fn dispatch(&self, id: ConnectionId, nachricht: ClientMessage) -> GatewayResult<()> {
        let state = &self.state;
        match nachricht {
            // -------------------------------------------------------------------
            // Sitzung
            // -------------------------------------------------------------------
            ClientMessage::Start(payload) => {
                relay::budget(state, id, LimitKlasse::Allgemein)?;
                session::starten(state, id, payload).await
            }
            ClientMessage::Stop => {
                relay::budget(state, id, LimitKlasse::Allgemein)?;
                session::stoppen(state, id).await
            }

            // -------------------------------------------------------------------
            // Eingaben
            // -------------------------------------------------------------------
            ClientMessage::UserAudio(payload) => relay::user_audio(state, id, payload).await,
            ClientMessage::RealtimeInput(payload) => relay::realtime_input(state, id, payload).await,
            ClientMessage::ToolResult(payload) => relay::tool_result(state, id, payload).await,
            ClientMessage::ContextUpdate(payload) => relay::context_update(state, id, payload).await,

            // -------------------------------------------------------------------
            // Keepalive
            // -------------------------------------------------------------------
            ClientMessage::HeartbeatAck => {
                state.registry.heartbeat_registrieren(id);
                Ok(())
            }
            ClientMessage::Ping => {
                // Nur erreichbar wenn der Schnellpfad das Frame nicht erkannt hat
                self.pong_senden(id);
                Ok(())
            }
        }
    }

    fn pong_senden(&self, id: ConnectionId) {
        self.state.registry.heartbeat_registrieren(id);
        self.state
            .registry
            .prioritaet_senden(id, Ausgehend::Nachricht(ServerMessage::pong()));
    }

    fn fehler_melden(&self, id: ConnectionId, typ: &str, fehler: GatewayError) {
        match &fehler {
            GatewayError::Intern(_) => {
                tracing::error!(connection_id = %id, typ, fehler = %fehler, "Handler-Fehler");
            }
            GatewayError::RateLimit { .. } => {
                tracing::debug!(connection_id = %id, typ, fehler = %fehler, "Rate-Limit");
            }
            _ => {
                tracing::warn!(connection_id = %id, typ, code = fehler.code().as_str(), fehler = %fehler, "Handler-Fehler");
            }
        }
        self.state.registry.senden(id, fehler.als_nachricht());
    }
}

// ---------------------------------------------------------------------------
// FrameQueue
// ---------------------------------------------------------------------------

/// Eingang einer Verbindung zwischen Lese-Loop und Handlern
pub struct FrameQueue {
    router: MessageRouter,
    id: ConnectionId,
    tx: mpsc::Sender<String>,
    ende: CancellationToken,
    arbeiter: JoinHandle<()>,
}

impl FrameQueue {
    /// Nimmt ein Frame an, ohne auf Handler zu warten
    ///
    /// `false` wenn das Frame verworfen wurde (Queue voll oder beendet).
    pub fn einreihen(&self, text: String) -> bool {
        if ist_ping(&text) {
            self.router.pong_senden(self.id);
            return true;
        }

        match self.tx.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(text)) => {
                tracing::warn!(
                    connection_id = %self.id,
                    laenge = text.len(),
                    kapazitaet = FRAME_QUEUE_GROESSE,
                    "Arbeits-Queue voll – Frame verworfen"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Nimmt keine Frames mehr an und wartet hoechstens `nachlauf` auf den
    /// laufenden Handler; danach wird er abgebrochen.
    ///
    /// Noch nicht begonnene Frames werden verworfen.
    pub async fn beenden(self, nachlauf: Duration) {
        let FrameQueue {
            id,
            tx,
            ende,
            mut arbeiter,
            ..
        } = self;
        drop(tx);
        ende.cancel();

        if tokio::time::timeout(nachlauf, &mut arbeiter).await.is_err() {
            tracing::debug!(connection_id = %id, "Handler haengt – Arbeits-Task wird abgebrochen");
            arbeiter.abort();
        }
    }
}
