//! Connection handlers for the Huddle server.
//!
//! Each WebSocket gets a reader loop feeding the hub and a writer task
//! draining the session's outbound queue.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use huddle_core::{ConnectionId, Hub, HubError};
use huddle_protocol::{codec, ServerMessage, GOODBYE_REASON};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Pong replies waiting for the writer.
const CONTROL_QUEUE: usize = 8;

/// Shared server state.
pub struct AppState {
    /// The session state machine.
    pub hub: Arc<Hub>,
    /// Server configuration.
    pub config: Config,
    /// Tracks connection tasks so shutdown can wait for them.
    pub tracker: TaskTracker,
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    let ws_path = state.config.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let pool = state.hub.pool().stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.hub.session_count(),
        "glyphs_available": pool.available,
        "glyphs_held": pool.held,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let tracker = state.tracker.clone();
    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| tracker.track_future(handle_websocket(socket, peer, state)))
}

/// Handle a WebSocket connection.
async fn handle_websocket(mut socket: WebSocket, peer: SocketAddr, state: Arc<AppState>) {
    let (session, outbound) = match state.hub.connect(Some(peer)) {
        Ok(pair) => pair,
        Err(e) => {
            debug!(peer = %peer, error = %e, "Refusing connection");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let _metrics_guard = ConnectionMetricsGuard::new();
    let id = session.id();
    let teardown = session.teardown_token();
    let writer_stop = CancellationToken::new();
    let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_loop(
        sink,
        outbound,
        control_rx,
        teardown.clone(),
        writer_stop.clone(),
        state.config.send_timeout(),
        id,
    ));

    loop {
        tokio::select! {
            () = teardown.cancelled() => {
                debug!(connection = %id, "Teardown requested");
                break;
            }

            () = writer_stop.cancelled() => {
                debug!(connection = %id, "Writer gone, closing connection");
                break;
            }

            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        metrics::record_message("inbound");
                        on_result(&state.hub, id, state.hub.handle_text(id, &text));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        metrics::record_message("inbound");
                        on_result(&state.hub, id, state.hub.handle_binary(id, &data));
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if control_tx.try_send(Message::Pong(data)).is_err() {
                            debug!(connection = %id, "Dropping pong, writer busy");
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %id, error = %e, "WebSocket error");
                        break;
                    }
                    None => {
                        debug!(connection = %id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // On teardown the writer says goodbye before it exits
    if !teardown.is_cancelled() {
        writer_stop.cancel();
    }

    match state.hub.disconnect(id) {
        Ok(_) => metrics::record_pool(state.hub.pool().stats()),
        Err(HubError::UnknownSession(_)) => {
            debug!(connection = %id, "Session already closed by server");
        }
        Err(e) => warn!(connection = %id, error = %e, "Disconnect failed"),
    }

    if let Err(e) = writer.await {
        warn!(connection = %id, error = %e, "Writer task failed");
    }
    drop(session);
}

fn on_result(hub: &Hub, id: ConnectionId, result: Result<(), HubError>) {
    match result {
        Ok(()) => {}
        Err(HubError::Protocol(_)) => metrics::record_protocol_error(),
        Err(HubError::Capacity) => debug!(connection = %id, "Handshake refused, pool exhausted"),
        Err(HubError::UnknownSession(_)) | Err(HubError::SessionClosed(_)) => {
            debug!(connection = %id, "Message for closed session ignored");
        }
        Err(e) => warn!(connection = %id, error = %e, "Message handling failed"),
    }
    metrics::record_pool(hub.pool().stats());
}

/// Drain the outbound queue into the socket.
///
/// Exits on teardown, on `stop`, or on the first failed write; `stop` is
/// cancelled on exit either way.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Arc<str>>,
    mut control: mpsc::Receiver<Message>,
    teardown: CancellationToken,
    stop: CancellationToken,
    send_timeout: Duration,
    id: ConnectionId,
) {
    // The reader stops with the writer
    let _stop_reader = stop.clone().drop_guard();

    loop {
        tokio::select! {
            biased;

            () = teardown.cancelled() => {
                say_goodbye(&mut sink, send_timeout, id).await;
                break;
            }

            () = stop.cancelled() => break,

            Some(msg) = control.recv() => {
                if !send(&mut sink, msg, send_timeout, id).await {
                    break;
                }
            }

            next = outbound.recv() => {
                let Some(text) = next else { break };
                if !send(&mut sink, Message::Text(text.to_string()), send_timeout, id).await {
                    break;
                }
                metrics::record_message("outbound");
            }
        }
    }
}

/// Send one frame, giving up after `send_timeout`.
async fn send(
    sink: &mut SplitSink<WebSocket, Message>,
    msg: Message,
    send_timeout: Duration,
    id: ConnectionId,
) -> bool {
    match tokio::time::timeout(send_timeout, sink.send(msg)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(connection = %id, error = %e, "Socket write failed");
            metrics::record_delivery_failures(1);
            false
        }
        Err(_) => {
            warn!(connection = %id, timeout_ms = send_timeout.as_millis() as u64, "Socket write timed out");
            metrics::record_delivery_failures(1);
            false
        }
    }
}

async fn say_goodbye(sink: &mut SplitSink<WebSocket, Message>, send_timeout: Duration, id: ConnectionId) {
    match codec::encode(&ServerMessage::goodbye()) {
        Ok(text) => {
            if !send(sink, Message::Text(text), send_timeout, id).await {
                return;
            }
        }
        Err(e) => warn!(connection = %id, error = %e, "Failed to encode goodbye"),
    }

    let close = Message::Close(Some(CloseFrame {
        code: close_code::AWAY,
        reason: GOODBYE_REASON.into(),
    }));
    send(sink, close, send_timeout, id).await;
}
