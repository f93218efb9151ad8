//! Ausgehende Queue einer Verbindung
//!
//! Zwei Spuren pro Client:
//! - normal: begrenzt, nicht-blockierend befuellt (Transkripte, Audio, Fehler)
//! - Prioritaet: unbegrenzt, wird vom Schreib-Task immer zuerst geleert
//!   (`pong`, `heartbeat`, WebSocket-Pings)
//!
//! Heartbeats duerfen nie hinter einem vollen Audio-Stau warten.

use livegate_core::ConnectionId;
use livegate_protocol::ServerMessage;
use tokio::sync::mpsc;

/// Groesse der normalen Send-Queue pro Client
const SEND_QUEUE_GROESSE: usize = 256;

/// Element der ausgehenden Queue
#[derive(Debug, Clone)]
pub enum Ausgehend {
    /// JSON-Frame
    Nachricht(ServerMessage),
    /// WebSocket-Ping (Transport-Ebene)
    Ping,
}

/// Handle auf die Send-Queues eines verbundenen Clients
#[derive(Clone, Debug)]
pub struct ClientSender {
    pub connection_id: ConnectionId,
    normal: mpsc::Sender<Ausgehend>,
    prioritaet: mpsc::UnboundedSender<Ausgehend>,
}

/// Lese-Seite fuer den Schreib-Task des Transports
pub struct ClientEmpfaenger {
    normal: mpsc::Receiver<Ausgehend>,
    prioritaet: mpsc::UnboundedReceiver<Ausgehend>,
}

impl ClientSender {
    /// Erstellt Sender und Empfaenger fuer eine neue Verbindung
    pub fn kanal(connection_id: ConnectionId) -> (Self, ClientEmpfaenger) {
        let (normal_tx, normal_rx) = mpsc::channel(SEND_QUEUE_GROESSE);
        let (prio_tx, prio_rx) = mpsc::unbounded_channel();
        (
            Self {
                connection_id,
                normal: normal_tx,
                prioritaet: prio_tx,
            },
            ClientEmpfaenger {
                normal: normal_rx,
                prioritaet: prio_rx,
            },
        )
    }

    /// Sendet eine Nachricht nicht-blockierend an den Client
    ///
    /// Gibt `false` zurueck wenn die Queue voll oder geschlossen ist.
    pub fn senden(&self, nachricht: ServerMessage) -> bool {
        match self.normal.try_send(Ausgehend::Nachricht(nachricht)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(verworfen)) => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    nachricht = typ_von(&verworfen),
                    "Send-Queue voll – Nachricht verworfen"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(
                    connection_id = %self.connection_id,
                    "Send-Queue geschlossen (Client getrennt)"
                );
                false
            }
        }
    }

    /// Sendet an der normalen Queue vorbei
    pub fn prioritaet_senden(&self, ausgehend: Ausgehend) -> bool {
        self.prioritaet.send(ausgehend).is_ok()
    }

    pub fn ist_geschlossen(&self) -> bool {
        self.normal.is_closed()
    }
}

impl ClientEmpfaenger {
    /// Naechstes ausgehendes Element, Prioritaetsspur zuerst
    ///
    /// `None` sobald alle Sender verworfen wurden.
    pub async fn naechste(&mut self) -> Option<Ausgehend> {
        tokio::select! {
            biased;
            Some(a) = self.prioritaet.recv() => Some(a),
            Some(a) = self.normal.recv() => Some(a),
            else => None,
        }
    }

    /// Nicht-blockierende Variante (fuer Tests)
    pub fn try_naechste(&mut self) -> Option<Ausgehend> {
        self.prioritaet
            .try_recv()
            .ok()
            .or_else(|| self.normal.try_recv().ok())
    }
}

fn typ_von(ausgehend: &Ausgehend) -> &'static str {
    match ausgehend {
        Ausgehend::Nachricht(n) => n.typ(),
        Ausgehend::Ping => "ws_ping",
    }
}
