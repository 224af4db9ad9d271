use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::StreamExt;
use relay_protocol::{AckPayload, RejectedPayload, SenderMessage, ServerMessage};
use tracing::{info, warn};

use crate::connection::{next_connection_id, run_queued_writer, ConnectionHandle, Role};
use crate::error::RelayError;
use crate::ingest::{self, IngestContext};
use crate::session::{self, NewSender, SessionEvent};
use crate::state::AppState;
use crate::ws_common::{recv_text, IDLE_READ_TIMEOUT};

/// `/pocket-parrot`: the capture client's sender endpoint (§6).
pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    if state.drain.is_draining() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| handle(socket, state, addr))
        .into_response()
}

async fn handle(socket: WebSocket, state: AppState, addr: SocketAddr) {
    let (sink, mut stream) = socket.split();
    let id = next_connection_id();
    let (handle, rx) = ConnectionHandle::queued(
        id.clone(),
        Role::Sender,
        addr.to_string(),
        state.config.write_queue_cap,
    );
    let handle = Arc::new(handle);
    tokio::spawn(run_queued_writer(sink, rx));

    let Some(text) = recv_text(&mut stream, IDLE_READ_TIMEOUT).await else {
        handle.force_close();
        return;
    };
    let (username, device_id) = match serde_json::from_str::<SenderMessage>(&text) {
        Ok(SenderMessage::Handshake(h)) => (h.username, h.device_id),
        _ => {
            warn!(connection_id = %id, "expected handshake as first sender message");
            handle.force_close();
            return;
        }
    };

    session::send_welcome(&handle).await;
    state.session.submit(SessionEvent::Connect(NewSender {
        handle: Arc::clone(&handle),
        username: username.clone(),
        device_id,
    }));
    info!(connection_id = %id, remote = %addr, "sender connected");

    let close = handle.close.clone();
    loop {
        tokio::select! {
            _ = close.notified() => break,
            text = recv_text(&mut stream, IDLE_READ_TIMEOUT) => {
                let Some(text) = text else { break };
                handle_sender_message(&state, &handle, &id, username.as_deref(), &text).await;
            }
        }
    }

    state.session.submit(SessionEvent::Disconnect { id: id.clone() });
    info!(connection_id = %id, "sender disconnected");
}

async fn handle_sender_message(
    state: &AppState,
    handle: &Arc<ConnectionHandle>,
    id: &str,
    username: Option<&str>,
    text: &str,
) {
    let message = match serde_json::from_str::<SenderMessage>(text) {
        Ok(message) => message,
        Err(err) => {
            warn!(connection_id = %id, error = %err, "malformed sender message");
            let reason = RelayError::ProtocolViolation {
                reason: err.to_string(),
            }
            .reason_code();
            handle.enqueue(&ServerMessage::Rejected(RejectedPayload {
                timestamp: Utc::now(),
                reason: reason.to_owned(),
            }));
            return;
        }
    };

    let frame = match message {
        SenderMessage::Handshake(_) => return,
        SenderMessage::Data(frame) => frame,
    };

    if !state.session.is_active(id) {
        session::reject_not_active(handle).await;
        return;
    }

    let received = frame.id.clone();
    let ctx = IngestContext {
        registry: &state.registry,
        batcher: &state.batcher,
        stats: &state.stats,
        ingest_hook: state.ingest_hook.as_ref(),
    };
    match ingest::accept(&ctx, handle, username, frame).await {
        Ok(()) => {
            handle.enqueue(&ServerMessage::Ack(AckPayload {
                timestamp: Utc::now(),
                received,
            }));
        }
        Err(err) => {
            handle.enqueue(&ServerMessage::Rejected(RejectedPayload {
                timestamp: Utc::now(),
                reason: err.reason_code().to_owned(),
            }));
        }
    }
    state.session.submit(SessionEvent::DataReceived { id: id.to_owned() });
}
