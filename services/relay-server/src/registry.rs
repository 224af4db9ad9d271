use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use relay_protocol::ServerMessage;
use tokio::sync::RwLock;

use crate::connection::{ConnectionHandle, EnqueueOutcome, Role};

/// One role's live connections, keyed by id. Senders are not tracked here —
/// their membership is coupled to promotion/eviction state and is owned
/// exclusively by the session manager (`session.rs`); this registry only
/// ever holds the four non-sender roles (§4.2).
#[derive(Default)]
struct RoleSet {
    connections: RwLock<HashMap<String, Arc<ConnectionHandle>>>,
}

impl RoleSet {
    async fn insert(&self, handle: Arc<ConnectionHandle>) {
        self.connections.write().await.insert(handle.id.clone(), handle);
    }

    async fn remove(&self, id: &str) {
        self.connections.write().await.remove(id);
    }

    async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Snapshot current membership and release the lock before any transport
    /// write happens — broadcast must never hold the registry lock across a
    /// send (§4.2, §5).
    async fn snapshot(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.read().await.values().cloned().collect()
    }
}

#[derive(Default)]
pub struct Registry {
    dashboards: RoleSet,
    listeners: RoleSet,
    orientation_listeners: RoleSet,
    bulk_listeners: RoleSet,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_for(&self, role: Role) -> &RoleSet {
        match role {
            Role::Dashboard => &self.dashboards,
            Role::Listener => &self.listeners,
            Role::OrientationListener => &self.orientation_listeners,
            Role::BulkListener => &self.bulk_listeners,
            Role::Sender => unreachable!("senders are tracked by the session manager"),
        }
    }

    pub async fn insert(&self, handle: Arc<ConnectionHandle>) {
        self.set_for(handle.role).insert(handle).await;
    }

    pub async fn remove(&self, role: Role, id: &str) {
        self.set_for(role).remove(id).await;
    }

    pub async fn count(&self, role: Role) -> usize {
        self.set_for(role).len().await
    }

    pub async fn dashboards_snapshot(&self) -> Vec<Arc<ConnectionHandle>> {
        self.dashboards.snapshot().await
    }

    pub async fn listeners_snapshot(&self) -> Vec<Arc<ConnectionHandle>> {
        self.listeners.snapshot().await
    }

    pub async fn orientation_listeners_snapshot(&self) -> Vec<Arc<ConnectionHandle>> {
        self.orientation_listeners.snapshot().await
    }

    pub async fn bulk_listeners_snapshot(&self) -> Vec<Arc<ConnectionHandle>> {
        self.bulk_listeners.snapshot().await
    }

    /// Sends `msg` to every connection currently registered under `role`,
    /// applying a best-effort (non-blocking) enqueue. Connections whose
    /// queue has closed are pruned from the registry; per-connection
    /// failures never propagate to the caller (§7). Use this for roles that
    /// don't need the deadline-based slow-consumer close (callers that do
    /// should use [`broadcast_with_backpressure`]).
    pub async fn broadcast(&self, role: Role, msg: &ServerMessage) {
        let set = self.set_for(role);
        let snapshot = set.snapshot().await;
        for handle in snapshot {
            if matches!(handle.enqueue(msg), EnqueueOutcome::Closed) {
                set.remove(&handle.id).await;
            }
        }
    }

    /// Force-closes every connection across all four tracked roles. Used by
    /// the shutdown coordinator (§4.8); senders are closed separately by the
    /// session manager, which owns their handles.
    pub async fn force_close_all(&self) {
        for role in [
            Role::Dashboard,
            Role::Listener,
            Role::OrientationListener,
            Role::BulkListener,
        ] {
            for handle in self.set_for(role).snapshot().await {
                handle.force_close();
            }
        }
    }
}

/// Sends `msg` to every connection registered under `role`, applying the
/// §5 slow-consumer policy: an immediate non-blocking enqueue first, and for
/// any connection whose queue is momentarily full, a bounded wait up to
/// `deadline` in a background task before closing it with `slow_consumer`.
/// A full queue never blocks delivery to the other recipients.
pub async fn broadcast_with_backpressure(
    registry: Arc<Registry>,
    role: Role,
    msg: ServerMessage,
    deadline: Duration,
) {
    let snapshot = registry.set_for(role).snapshot().await;
    for handle in snapshot {
        match handle.enqueue(&msg) {
            EnqueueOutcome::Sent => {}
            EnqueueOutcome::Closed => registry.remove(role, &handle.id).await,
            EnqueueOutcome::Dropped => {
                let registry = Arc::clone(&registry);
                let msg = msg.clone();
                tokio::spawn(async move {
                    let outcome = handle.enqueue_with_deadline(&msg, deadline).await;
                    if !matches!(outcome, EnqueueOutcome::Sent) {
                        handle.force_close();
                        registry.remove(role, &handle.id).await;
                    }
                });
            }
        }
    }
}
