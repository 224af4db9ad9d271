use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use relay_protocol::{
    DataReceivedPayload, ErrorPayload, ServerMessage, StatsPayload, StatsSnapshot,
    UserConnectionPayload,
};
use tokio::sync::RwLock;

use crate::connection::Role;
use crate::registry::Registry;
use crate::session::SessionSnapshot;

/// Rolling/monotonic counters (§4.7). `data_points_window` resets on the
/// periodic 1-minute tick; `total_data_points` never decreases (§8 counter
/// monotonicity).
#[derive(Default)]
struct Counters {
    total_data_points: u64,
    data_points_window: u64,
}

/// Telemetry & Stats Broadcaster (§4.7). Owns nothing exclusively — it reads
/// the registry's per-role counts and the session manager's published
/// snapshot, and holds its own counters behind one `RwLock`. Recomputes and
/// broadcasts a `StatsSnapshot` to dashboards and passive listeners on every
/// connect/disconnect/data/error event and on the periodic tick.
pub struct Stats {
    registry: Arc<Registry>,
    max_users: usize,
    bulk_queue_len: Arc<AtomicUsize>,
    counters: RwLock<Counters>,
    started_at: Instant,
    session: RwLock<SessionSnapshot>,
}

impl Stats {
    pub fn new(registry: Arc<Registry>, max_users: usize, bulk_queue_len: Arc<AtomicUsize>) -> Self {
        Self {
            registry,
            max_users,
            bulk_queue_len,
            counters: RwLock::new(Counters::default()),
            started_at: Instant::now(),
            session: RwLock::new(SessionSnapshot::default()),
        }
    }

    /// Lets the session manager keep the stats broadcaster's view of the
    /// sender population current without either one locking the other's
    /// state directly (§9: no component holds two of these locks at once).
    pub async fn observe_session(&self, snapshot: SessionSnapshot) {
        *self.session.write().await = snapshot;
    }

    pub async fn user_connected(&self, user_id: &str, username: Option<&str>) {
        let _ = username;
        self.registry
            .broadcast(
                Role::Dashboard,
                &ServerMessage::UserConnected(UserConnectionPayload {
                    timestamp: Utc::now(),
                    user_id: user_id.to_owned(),
                }),
            )
            .await;
        self.broadcast_snapshot().await;
    }

    pub async fn user_disconnected(&self, user_id: &str) {
        self.registry
            .broadcast(
                Role::Dashboard,
                &ServerMessage::UserDisconnected(UserConnectionPayload {
                    timestamp: Utc::now(),
                    user_id: user_id.to_owned(),
                }),
            )
            .await;
        self.broadcast_snapshot().await;
    }

    /// Records one accepted data point and returns its 1-based ordinal for
    /// this sender, for the `data_received {pointNumber}` dashboard event.
    pub async fn data_received(&self, user_id: &str, point_number: u64) {
        {
            let mut counters = self.counters.write().await;
            counters.total_data_points += 1;
            counters.data_points_window += 1;
        }
        self.registry
            .broadcast(
                Role::Dashboard,
                &ServerMessage::DataReceived(DataReceivedPayload {
                    timestamp: Utc::now(),
                    user_id: user_id.to_owned(),
                    point_number,
                }),
            )
            .await;
        self.broadcast_snapshot().await;
    }

    pub async fn error(&self, message: &str) {
        self.registry
            .broadcast(
                Role::Dashboard,
                &ServerMessage::Error(ErrorPayload {
                    timestamp: Utc::now(),
                    message: message.to_owned(),
                }),
            )
            .await;
        self.broadcast_snapshot().await;
    }

    /// Periodic 1-minute tick (§4.7): resets the rolling rate window and
    /// broadcasts a fresh snapshot regardless of whether anything changed.
    pub async fn periodic_tick(&self) {
        {
            let mut counters = self.counters.write().await;
            counters.data_points_window = 0;
        }
        self.broadcast_snapshot().await;
    }

    pub async fn snapshot(&self) -> StatsSnapshot {
        let counters = self.counters.read().await;
        let session = self.session.read().await;
        StatsSnapshot {
            active_users: session.sender_count,
            max_users: self.max_users,
            orientation_listeners: self.registry.count(Role::OrientationListener).await,
            bulk_data_listeners: self.registry.count(Role::BulkListener).await,
            passive_listeners: self.registry.count(Role::Listener).await,
            dashboards: self.registry.count(Role::Dashboard).await,
            total_data_points: counters.total_data_points,
            data_rate_per_minute: counters.data_points_window,
            bulk_queue_size: self.bulk_queue_len.load(Ordering::Relaxed),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            users: session.users.clone(),
        }
    }

    async fn broadcast_snapshot(&self) {
        let payload = ServerMessage::Stats(StatsPayload {
            timestamp: Utc::now(),
            snapshot: self.snapshot().await,
        });
        self.registry.broadcast(Role::Dashboard, &payload).await;
        self.registry.broadcast(Role::Listener, &payload).await;
    }
}
