use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use crate::batcher::{self, BatcherHandle};
use crate::config::Config;
use crate::ingest::{IngestHook, NoopIngestHook};
use crate::registry::Registry;
use crate::session::{self, SessionHandle};
use crate::shutdown::DrainGate;
use crate::stats::Stats;

/// How often the Telemetry & Stats Broadcaster resets its rolling rate
/// window and pushes a fresh snapshot regardless of activity (§4.7).
const STATS_TICK_INTERVAL: Duration = Duration::from_secs(60);

/// The process-wide state handed to every route. `Clone` is cheap: every
/// field is already an `Arc`, a channel handle, or plain `Copy`/small data,
/// matching the teacher's `AppState` being a bundle of shared handles rather
/// than the owner of its own interior mutability.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub registry: Arc<Registry>,
    pub session: SessionHandle,
    pub batcher: BatcherHandle,
    pub stats: Arc<Stats>,
    pub ingest_hook: Arc<dyn IngestHook>,
    /// Set by the shutdown coordinator (§4.8); checked by every upgrade
    /// handler so the router stops accepting new connections during drain.
    pub drain: DrainGate,
}

impl AppState {
    /// Wires the Session Manager, Bulk Batcher, and stats tick timer from a
    /// resolved `Config`, with the default no-op ingest hook (§6).
    pub fn new(config: Config) -> Self {
        Self::with_ingest_hook(config, Arc::new(NoopIngestHook))
    }

    /// Same wiring, but with a caller-supplied ingest hook — the seam a
    /// storage engine or analytics sink attaches through (§6) without this
    /// crate depending on one.
    pub fn with_ingest_hook(config: Config, ingest_hook: Arc<dyn IngestHook>) -> Self {
        let registry = Arc::new(Registry::new());
        let bulk_queue_len = Arc::new(AtomicUsize::new(0));
        let stats = Arc::new(Stats::new(
            Arc::clone(&registry),
            config.max_senders,
            Arc::clone(&bulk_queue_len),
        ));
        let session = session::spawn(config.max_senders, config.sender_timeout, Arc::clone(&stats));
        let batcher = batcher::spawn(
            Arc::clone(&registry),
            config.max_batch_size,
            config.batch_interval,
            config.slow_consumer_deadline,
            bulk_queue_len,
        );
        spawn_stats_tick(Arc::clone(&stats));

        Self {
            config,
            registry,
            session,
            batcher,
            stats,
            ingest_hook,
            drain: DrainGate::default(),
        }
    }
}

fn spawn_stats_tick(stats: Arc<Stats>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_TICK_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            stats.periodic_tick().await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

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
            drain_deadline: Duration::from_secs(1),
            log_level: "info".to_owned(),
        }
    }

    #[tokio::test]
    async fn new_state_starts_with_an_empty_stats_snapshot() {
        let state = AppState::new(test_config());
        let snapshot = state.stats.snapshot().await;
        assert_eq!(snapshot.active_users, 0);
        assert_eq!(snapshot.max_users, 4);
    }
}
