use relay_protocol::{OrientationDataPayload, ServerMessage};

use crate::connection::EnqueueOutcome;
use crate::registry::Registry;

/// Forwards one orientation reading to every currently registered
/// orientation listener, immediately and without batching (§4.5). Slow
/// consumers never block this path: `ConnectionHandle::enqueue` on an
/// orientation listener always succeeds, dropping whatever hadn't been
/// consumed yet (§5 newest-wins).
pub async fn dispatch(registry: &Registry, payload: OrientationDataPayload) {
    let msg = ServerMessage::OrientationData(payload);
    for handle in registry.orientation_listeners_snapshot().await {
        if matches!(handle.enqueue(&msg), EnqueueOutcome::Closed) {
            registry
                .remove(crate::connection::Role::OrientationListener, &handle.id)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{next_connection_id, test_support, Role};
    use chrono::Utc;
    use relay_protocol::Orientation;
    use std::sync::Arc;

    fn payload() -> OrientationDataPayload {
        OrientationDataPayload {
            timestamp: Utc::now(),
            user_id: "sender-1".to_owned(),
            username: None,
            orientation: Orientation {
                alpha: 1.0,
                beta: 2.0,
                gamma: 3.0,
                compass: None,
            },
        }
    }

    #[tokio::test]
    async fn dispatch_delivers_to_every_registered_listener() {
        let registry = Registry::new();
        let (handle, mut rx) =
            test_support::latest_handle(next_connection_id(), Role::OrientationListener);
        registry.insert(Arc::new(handle)).await;

        dispatch(&registry, payload()).await;

        assert!(rx.changed().await.is_ok());
    }

    #[tokio::test]
    async fn dispatch_is_a_no_op_with_no_listeners() {
        let registry = Registry::new();
        dispatch(&registry, payload()).await;
        assert_eq!(registry.count(Role::OrientationListener).await, 0);
    }
}
