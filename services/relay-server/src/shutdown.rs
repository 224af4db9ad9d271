use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use relay_protocol::{ServerMessage, TimestampOnly};
use tracing::{info, warn};

use crate::connection::Role;
use crate::session::SessionEvent;
use crate::state::AppState;

/// Flips once drain begins; every upgrade handler checks this before
/// registering a new Connection (§4.8 "stop accepting new connections").
#[derive(Clone, Default)]
pub struct DrainGate(Arc<AtomicBool>);

impl DrainGate {
    pub fn is_draining(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn begin(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Drains the process for a clean exit (§4.8): stop accepting, flush the
/// bulk queue to whatever bulk listeners are still around, broadcast
/// `server_shutdown` to every role including senders, then force-close every
/// transport. The whole sequence is bounded by `DRAIN_DEADLINE`; a Connection
/// that doesn't close itself in time is force-closed anyway.
pub async fn run(state: AppState) {
    state.drain.begin();
    info!("shutdown: draining");

    let deadline = state.config.drain_deadline;
    let drained = tokio::time::timeout(deadline, drain(&state)).await;
    if drained.is_err() {
        warn!(?deadline, "drain deadline exceeded, force-closing remaining connections");
    }

    state.registry.force_close_all().await;
    info!("shutdown: all transports closed");
}

async fn drain(state: &AppState) {
    // Flush whatever is queued so bulk listeners get one final batch before
    // the shutdown notice (§8 scenario 6: batch, then server_shutdown, then
    // close).
    state.batcher.shutdown().await;

    let shutdown_msg = ServerMessage::ServerShutdown(TimestampOnly {
        timestamp: Utc::now(),
    });
    for role in [
        Role::Dashboard,
        Role::Listener,
        Role::OrientationListener,
        Role::BulkListener,
    ] {
        state.registry.broadcast(role, &shutdown_msg).await;
    }

    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    state.session.submit(SessionEvent::Shutdown(reply_tx));
    let _ = reply_rx.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::time::Duration;

    fn test_config() -> Config {
        Config {
            port: 0,
            bind_addr: "0.0.0.0:0".to_owned(),
            max_senders: 4,
            sender_timeout: Duration::from_secs(120),
            batch_interval: Duration::from_secs(60),
            max_batch_size: 10,
            write_queue_cap: 8,
            slow_consumer_deadline: Duration::from_millis(200),
            drain_deadline: Duration::from_millis(500),
            log_level: "info".to_owned(),
        }
    }

    #[tokio::test]
    async fn run_flips_the_drain_gate() {
        let state = AppState::new(test_config());
        assert!(!state.drain.is_draining());
        run(state.clone()).await;
        assert!(state.drain.is_draining());
    }
}
