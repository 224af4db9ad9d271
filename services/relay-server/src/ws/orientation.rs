use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use relay_protocol::{ServerMessage, TimestampOnly};
use tracing::info;

use crate::connection::{next_connection_id, render, run_latest_writer, ConnectionHandle, Role};
use crate::state::AppState;
use crate::ws_common::run_until_closed;

/// `/orientation`: the fast-path fan-out target (§4.5, §6). Uses the
/// `watch`-backed "latest" write channel rather than a bounded queue, so a
/// slow reader can never build a backlog — only the newest orientation
/// reading is ever pending (§5 newest-wins).
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
    let (mut sink, mut stream) = socket.split();
    let id = next_connection_id();
    let (handle, rx) = ConnectionHandle::latest(id.clone(), Role::OrientationListener, addr.to_string());
    let handle = Arc::new(handle);

    // Sent directly on the sink, before the watch-backed writer task exists,
    // so the connect banner (§6) can never be coalesced away by an
    // orientation reading landing in the same newest-wins slot.
    let banner = ServerMessage::OrientationListenerConnected(TimestampOnly {
        timestamp: Utc::now(),
    });
    if sink.send(render(&banner)).await.is_err() {
        return;
    }

    tokio::spawn(run_latest_writer(sink, rx));

    state.registry.insert(Arc::clone(&handle)).await;
    info!(connection_id = %id, remote = %addr, "orientation listener connected");

    run_until_closed(&mut stream, &handle.close).await;

    state
        .registry
        .remove(Role::OrientationListener, &id)
        .await;
    info!(
        connection_id = %id,
        dropped = handle.dropped_count(),
        "orientation listener disconnected"
    );
}
