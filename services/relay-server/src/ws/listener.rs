use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::StreamExt;
use relay_protocol::{ServerMessage, StatsPayload, TimestampOnly};
use tracing::info;

use crate::connection::{next_connection_id, run_queued_writer, ConnectionHandle, Role};
use crate::state::AppState;
use crate::ws_common::run_until_closed;

/// `/listener`: passive listeners (§6) — the unsplit `sensor_data` stream
/// plus `stats`, read-only from the client's perspective.
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
        Role::Listener,
        addr.to_string(),
        state.config.write_queue_cap,
    );
    let handle = Arc::new(handle);
    tokio::spawn(run_queued_writer(sink, rx));

    state.registry.insert(Arc::clone(&handle)).await;
    info!(connection_id = %id, remote = %addr, "listener connected");

    handle.enqueue(&ServerMessage::ListenerConnected(TimestampOnly {
        timestamp: Utc::now(),
    }));
    handle.enqueue(&ServerMessage::Stats(StatsPayload {
        timestamp: Utc::now(),
        snapshot: state.stats.snapshot().await,
    }));

    run_until_closed(&mut stream, &handle.close).await;

    state.registry.remove(Role::Listener, &id).await;
    info!(connection_id = %id, "listener disconnected");
}
