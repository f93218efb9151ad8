//! HTTP- und WebSocket-Transport
//!
//! - `GET /` und `GET /ws` mit Upgrade: WebSocket-Verbindung zum Gateway
//! - `GET /health`: Liveness mit aktueller Last
//! - alles andere (auch `/` ohne Upgrade): 404
//!
//! Pro Verbindung laufen drei Tasks: der Lese-Loop (dieser Task) beantwortet
//! Pings sofort und reiht alle anderen Text-Frames in die [`FrameQueue`] ein,
//! deren Arbeits-Task sie der Reihe nach an den Router gibt. Ein Schreib-Task
//! leert die ausgehenden Queues der Verbindung (Prioritaetsspur zuerst).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use livegate_core::ConnectionId;
use livegate_gateway::{connection, Ausgehend, ClientEmpfaenger, FrameQueue, GatewayState, MessageRouter};
use livegate_observability::{health_router, timing_middleware, HealthState};
use livegate_protocol::ServerMessage;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Wie lange Arbeits- und Schreib-Task nach dem Lese-Ende noch laufen duerfen
const NACHLAUF: Duration = Duration::from_secs(2);

#[derive(Clone)]
struct TransportState {
    router: MessageRouter,
    shutdown: CancellationToken,
}

/// Baut den axum-Router des Gateway-Ports
pub fn router(state: Arc<GatewayState>, health: HealthState, shutdown: CancellationToken) -> Router {
    let metriken = state.metriken.clone();
    let transport = TransportState {
        router: MessageRouter::neu(state),
        shutdown,
    };

    Router::new()
        .route("/", get(upgrade))
        .route("/ws", get(upgrade))
        .with_state(transport)
        .merge(health_router(health))
        .fallback(nicht_gefunden)
        .layer(axum::middleware::from_fn_with_state(metriken, timing_middleware))
}

async fn nicht_gefunden() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn upgrade(
    State(transport): State<TransportState>,
    upgrade: Option<WebSocketUpgrade>,
) -> Response {
    match upgrade {
        Some(ws) => ws
            .on_upgrade(move |socket| verbindung_bedienen(socket, transport))
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// ---------------------------------------------------------------------------
// Verbindung
// ---------------------------------------------------------------------------

async fn verbindung_bedienen(socket: WebSocket, transport: TransportState) {
    let state = Arc::clone(transport.router.state());
    let (id, empfaenger) = connection::initialisieren(&state);
    let span = tracing::info_span!("verbindung", connection_id = %id);

    async move {
        let abbruch = state
            .registry
            .mit_verbindung(id, |s| s.abbruch.clone())
            .unwrap_or_default();

        let (ws_tx, ws_rx) = socket.split();
        let mut schreiber = tokio::spawn(schreiben(id, ws_tx, empfaenger).in_current_span());

        let queue = transport.router.frame_queue(id);
        let (code, grund) = lesen(id, ws_rx, &queue, &transport, &state, &abbruch).await;
        queue.beenden(NACHLAUF).await;
        connection::aufraeumen(&state, id, code, grund).await;

        // Ohne Sender in der Registry endet der Schreib-Task von selbst
        if tokio::time::timeout(NACHLAUF, &mut schreiber).await.is_err() {
            tracing::debug!(connection_id = %id, "Schreib-Task haengt – wird abgebrochen");
            schreiber.abort();
        }
    }
    .instrument(span)
    .await;
}

/// Lese-Loop; liefert Close-Code und Grund
async fn lesen(
    id: ConnectionId,
    mut ws_rx: futures_util::stream::SplitStream<WebSocket>,
    queue: &FrameQueue,
    transport: &TransportState,
    state: &GatewayState,
    abbruch: &CancellationToken,
) -> (Option<u16>, &'static str) {
    let intervall = state.config.heartbeat_intervall;
    let mut takt = tokio::time::interval_at(tokio::time::Instant::now() + intervall, intervall);

    loop {
        tokio::select! {
            _ = abbruch.cancelled() => return (None, "heartbeat_timeout"),
            _ = transport.shutdown.cancelled() => return (Some(1001), "server_shutdown"),
            _ = takt.tick() => {
                state
                    .registry
                    .prioritaet_senden(id, Ausgehend::Nachricht(ServerMessage::heartbeat()));
            }
            eingang = ws_rx.next() => match eingang {
                Some(Ok(Message::Text(text))) => {
                    queue.einreihen(text);
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    state.registry.heartbeat_registrieren(id);
                }
                Some(Ok(Message::Binary(daten))) => {
                    tracing::debug!(connection_id = %id, bytes = daten.len(), "Binaer-Frame ignoriert");
                }
                Some(Ok(Message::Close(frame))) => {
                    return (frame.map(|f| f.code), "client_close");
                }
                Some(Err(e)) => {
                    tracing::debug!(connection_id = %id, fehler = %e, "WebSocket-Lesefehler");
                    return (None, "lesefehler");
                }
                None => return (None, "stream_ende"),
            }
        }
    }
}

/// Schreib-Task: leert die Queues der Verbindung in den Socket
async fn schreiben(
    id: ConnectionId,
    mut ws_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    mut empfaenger: ClientEmpfaenger,
) {
    while let Some(ausgehend) = empfaenger.naechste().await {
        let frame = match ausgehend {
            Ausgehend::Ping => Message::Ping(Vec::new()),
            Ausgehend::Nachricht(nachricht) => match nachricht.to_json() {
                Ok(json) => Message::Text(json),
                Err(e) => {
                    tracing::error!(connection_id = %id, typ = nachricht.typ(), fehler = %e, "Serialisierung fehlgeschlagen");
                    continue;
                }
            },
        };
        if let Err(e) = ws_tx.send(frame).await {
            tracing::debug!(connection_id = %id, fehler = %e, "WebSocket-Schreibfehler");
            break;
        }
    }
    let _ = ws_tx.close().await;
}
