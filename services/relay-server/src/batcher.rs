use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use relay_protocol::{BulkBatch, BulkItem, ServerMessage};
use tokio::sync::{mpsc, oneshot};

use crate::connection::Role;
use crate::registry::{self, Registry};

pub enum BatcherMsg {
    Item(BulkItem),
    /// Drains the remainder unconditionally and replies once the final
    /// flush has been dispatched, so the shutdown coordinator can order
    /// "flush, then close transports" (§4.8).
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct BatcherHandle {
    tx: mpsc::UnboundedSender<BatcherMsg>,
}

impl BatcherHandle {
    pub fn enqueue(&self, item: BulkItem) {
        let _ = self.tx.send(BatcherMsg::Item(item));
    }

    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(BatcherMsg::Shutdown(reply_tx)).is_ok() {
            let _ = reply_rx.await;
        }
    }
}

/// Spawns the Bulk Batcher (§4.6): a single task owning `bulkQueue`
/// exclusively, so the size and time triggers can never race each other
/// into a concurrent flush (§5). `queue_len` is shared with `Stats` for the
/// `bulkQueueSize` snapshot field, updated after every mutation.
pub fn spawn(
    registry: Arc<Registry>,
    max_batch_size: usize,
    batch_interval: Duration,
    slow_consumer_deadline: Duration,
    queue_len: Arc<AtomicUsize>,
) -> BatcherHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(
        rx,
        registry,
        max_batch_size,
        batch_interval,
        slow_consumer_deadline,
        queue_len,
    ));
    BatcherHandle { tx }
}

async fn maybe_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<BatcherMsg>,
    registry: Arc<Registry>,
    max_batch_size: usize,
    batch_interval: Duration,
    slow_consumer_deadline: Duration,
    queue_len: Arc<AtomicUsize>,
) {
    let mut queue: VecDeque<BulkItem> = VecDeque::new();
    let mut ticker: Option<tokio::time::Interval> = None;

    loop {
        let has_listeners = registry.count(Role::BulkListener).await > 0;
        match (&ticker, has_listeners) {
            (None, true) => {
                let mut interval = tokio::time::interval(batch_interval);
                interval.tick().await; // first tick fires immediately
                ticker = Some(interval);
            }
            (Some(_), false) => ticker = None,
            _ => {}
        }

        tokio::select! {
            biased;
            msg = rx.recv() => {
                match msg {
                    Some(BatcherMsg::Item(item)) => {
                        queue.push_back(item);
                        queue_len.store(queue.len(), Ordering::Relaxed);
                        while queue.len() >= max_batch_size {
                            flush(&mut queue, &registry, max_batch_size, slow_consumer_deadline, &queue_len).await;
                        }
                    }
                    Some(BatcherMsg::Shutdown(reply)) => {
                        while !queue.is_empty() {
                            flush(&mut queue, &registry, max_batch_size, slow_consumer_deadline, &queue_len).await;
                        }
                        let _ = reply.send(());
                        return;
                    }
                    None => return,
                }
            }
            _ = maybe_tick(&mut ticker) => {
                if !queue.is_empty() {
                    flush(&mut queue, &registry, max_batch_size, slow_consumer_deadline, &queue_len).await;
                }
            }
        }
    }
}

/// Flushes the prefix of length `min(queue.len(), max_batch_size)` as one
/// `BulkBatch` (§4.6, §8 batch bound: `1 <= batchSize <= MAX_BATCH_SIZE`).
async fn flush(
    queue: &mut VecDeque<BulkItem>,
    registry: &Arc<Registry>,
    max_batch_size: usize,
    slow_consumer_deadline: Duration,
    queue_len: &Arc<AtomicUsize>,
) {
    let take = queue.len().min(max_batch_size);
    if take == 0 {
        return;
    }
    let data: Vec<BulkItem> = queue.drain(..take).collect();
    queue_len.store(queue.len(), Ordering::Relaxed);
    let batch = BulkBatch {
        timestamp: Utc::now(),
        batch_size: data.len(),
        data,
    };
    registry::broadcast_with_backpressure(
        Arc::clone(registry),
        Role::BulkListener,
        ServerMessage::BulkDataBatch(batch),
        slow_consumer_deadline,
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{next_connection_id, test_support};
    use std::time::Duration as StdDuration;

    fn item(n: i64) -> BulkItem {
        BulkItem {
            timestamp: Utc::now(),
            user_id: "sender-1".to_owned(),
            username: None,
            gps: None,
            motion: None,
            weather: None,
            objects_detected: None,
            photo_base64: None,
            audio_base64: Some(n.to_string()),
        }
    }

    #[tokio::test]
    async fn size_trigger_flushes_exactly_one_batch_at_threshold() {
        let registry = Arc::new(Registry::new());
        let (handle, mut rx) =
            test_support::queued_handle(next_connection_id(), Role::BulkListener, 16);
        registry.insert(Arc::new(handle)).await;
        let queue_len = Arc::new(AtomicUsize::new(0));
        let batcher = spawn(
            Arc::clone(&registry),
            3,
            StdDuration::from_secs(60),
            StdDuration::from_millis(200),
            queue_len,
        );

        for n in 0..3 {
            batcher.enqueue(item(n));
        }

        let message = tokio::time::timeout(StdDuration::from_millis(500), rx.recv())
            .await
            .expect("batch should arrive")
            .expect("channel open");
        let axum::extract::ws::Message::Text(text) = message else {
            panic!("expected text frame");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "bulk_data_batch");
        assert_eq!(value["batchSize"], 3);
    }

    #[tokio::test]
    async fn time_trigger_flushes_a_partial_queue() {
        let registry = Arc::new(Registry::new());
        let (handle, mut rx) =
            test_support::queued_handle(next_connection_id(), Role::BulkListener, 16);
        registry.insert(Arc::new(handle)).await;
        let queue_len = Arc::new(AtomicUsize::new(0));
        let batcher = spawn(
            Arc::clone(&registry),
            10,
            StdDuration::from_millis(30),
            StdDuration::from_millis(200),
            queue_len,
        );

        batcher.enqueue(item(1));

        let message = tokio::time::timeout(StdDuration::from_millis(500), rx.recv())
            .await
            .expect("batch should arrive")
            .expect("channel open");
        let axum::extract::ws::Message::Text(text) = message else {
            panic!("expected text frame");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["batchSize"], 1);
    }

    #[tokio::test]
    async fn shutdown_drains_the_remainder_unconditionally() {
        let registry = Arc::new(Registry::new());
        let (handle, mut rx) =
            test_support::queued_handle(next_connection_id(), Role::BulkListener, 16);
        registry.insert(Arc::new(handle)).await;
        let queue_len = Arc::new(AtomicUsize::new(0));
        let batcher = spawn(
            Arc::clone(&registry),
            10,
            StdDuration::from_secs(60),
            StdDuration::from_millis(200),
            queue_len,
        );

        for n in 0..5 {
            batcher.enqueue(item(n));
        }
        batcher.shutdown().await;

        let message = tokio::time::timeout(StdDuration::from_millis(200), rx.recv())
            .await
            .expect("batch should arrive")
            .expect("channel open");
        let axum::extract::ws::Message::Text(text) = message else {
            panic!("expected text frame");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["batchSize"], 5);
    }
}
