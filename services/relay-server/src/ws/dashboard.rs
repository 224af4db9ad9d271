use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::StreamExt;
use relay_protocol::{DashboardRequest, ServerMessage, StatsPayload};
use tracing::{info, warn};

use crate::connection::{next_connection_id, run_queued_writer, ConnectionHandle, Role};
use crate::state::AppState;
use crate::ws_common::ViolationTracker;

/// `/dashboard`: monitoring clients (§6). Mostly server->client; a client may
/// send `getStats` to request an immediate snapshot outside the periodic tick.
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
        Role::Dashboard,
        addr.to_string(),
        state.config.write_queue_cap,
    );
    let handle = Arc::new(handle);
    tokio::spawn(run_queued_writer(sink, rx));

    state.registry.insert(Arc::clone(&handle)).await;
    info!(connection_id = %id, remote = %addr, "dashboard connected");

    handle.enqueue(&current_stats(&state).await);

    // No idle-read timeout here: a dashboard only ever sends `getStats`
    // optionally, so a long gap between client requests doesn't mean the
    // Connection is dead. The writer task's periodic heartbeat (§5,
    // `connection.rs`) is what lets the dashboard tell "quiet but alive"
    // from "gone"; this loop only watches for the peer actually closing.
    let close = handle.close.clone();
    let mut violations = ViolationTracker::default();
    loop {
        tokio::select! {
            _ = close.notified() => break,
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if serde_json::from_str::<DashboardRequest>(&text).is_ok() {
                            handle.enqueue(&current_stats(&state).await);
                        } else if violations.record() {
                            warn!(connection_id = %id, "dashboard exceeded protocol violation threshold");
                            break;
                        }
                    }
                    None | Some(Ok(Message::Close(_))) | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.registry.remove(Role::Dashboard, &id).await;
    info!(connection_id = %id, "dashboard disconnected");
}

async fn current_stats(state: &AppState) -> ServerMessage {
    ServerMessage::Stats(StatsPayload {
        timestamp: Utc::now(),
        snapshot: state.stats.snapshot().await,
    })
}
