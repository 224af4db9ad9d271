use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use relay_protocol::{ServerMessage, TimestampOnly};
use tokio::sync::{mpsc, watch, Notify};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// How often a server->client-only writer task emits a `heartbeat` frame on
/// its own, independent of whatever application traffic is flowing. Mirrors
/// the teacher's `ws_forwarder.rs` `HEARTBEAT_INTERVAL`: proactive liveness
/// rather than relying on the read side ever seeing inbound text (§5).
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

fn heartbeat_message() -> Message {
    render(&ServerMessage::Heartbeat(TimestampOnly {
        timestamp: Utc::now(),
    }))
}

/// Renders a `ServerMessage` to its wire frame. Exposed so a handler can
/// send one directly on a `SplitSink` before handing the sink off to a
/// writer task — the only way to guarantee delivery of a message that must
/// not be subject to a role's back-pressure or coalescing policy (§6).
pub fn render(msg: &ServerMessage) -> Message {
    Message::Text(msg.to_json().into())
}

/// A server-assigned id, unique for the process lifetime (§3 Connection).
pub fn next_connection_id() -> String {
    format!("c{}", NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Role {
    Sender,
    Dashboard,
    Listener,
    OrientationListener,
    BulkListener,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Sender => "sender",
            Role::Dashboard => "dashboard",
            Role::Listener => "listener",
            Role::OrientationListener => "orientation_listener",
            Role::BulkListener => "bulk_listener",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The write side of a Connection. Queued roles get a bounded write queue of
/// capacity `WRITE_QUEUE_CAP`, drained serially by a writer task (§5). The
/// orientation listener role gets a `watch` channel instead: it can only
/// ever hold one pending value, which is exactly the newest-wins drop policy
/// §5 specifies for that role — no ring buffer or "find the oldest entry"
/// bookkeeping needed.
enum WriteChannel {
    Queued(mpsc::Sender<Message>),
    Latest(watch::Sender<Option<Message>>),
}

pub struct ConnectionHandle {
    pub id: String,
    pub role: Role,
    /// §3 Connection attributes common to every role.
    pub connected_at: chrono::DateTime<chrono::Utc>,
    pub remote_address: String,
    channel: WriteChannel,
    pub dropped: AtomicU64,
    /// Role-specific counter: accepted `data` frames for a sender (§3).
    /// Unused, but harmless, for the other four roles.
    pub data_count: AtomicU64,
    /// Cooperative close signal. The session manager and the shutdown
    /// coordinator use this to ask a reader task to stop, independent of
    /// whatever the transport itself is doing.
    pub close: Arc<Notify>,
}

pub enum EnqueueOutcome {
    Sent,
    Dropped,
    Closed,
}

impl ConnectionHandle {
    pub(crate) fn queued(
        id: String,
        role: Role,
        remote_address: String,
        cap: usize,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(cap);
        (
            Self {
                id,
                role,
                connected_at: chrono::Utc::now(),
                remote_address,
                channel: WriteChannel::Queued(tx),
                dropped: AtomicU64::new(0),
                data_count: AtomicU64::new(0),
                close: Arc::new(Notify::new()),
            },
            rx,
        )
    }

    pub(crate) fn latest(
        id: String,
        role: Role,
        remote_address: String,
    ) -> (Self, watch::Receiver<Option<Message>>) {
        let (tx, rx) = watch::channel(None);
        (
            Self {
                id,
                role,
                connected_at: chrono::Utc::now(),
                remote_address,
                channel: WriteChannel::Latest(tx),
                dropped: AtomicU64::new(0),
                data_count: AtomicU64::new(0),
                close: Arc::new(Notify::new()),
            },
            rx,
        )
    }

    /// Non-blocking enqueue. Orientation listeners always report `Sent`
    /// (overwriting whatever hadn't been consumed yet and counting it as
    /// dropped); other roles report back pressure so the caller can apply
    /// its own deadline policy (§5).
    pub fn enqueue(&self, msg: &ServerMessage) -> EnqueueOutcome {
        let message = render(msg);
        match &self.channel {
            WriteChannel::Queued(tx) => match tx.try_send(message) {
                Ok(()) => EnqueueOutcome::Sent,
                Err(mpsc::error::TrySendError::Full(_)) => EnqueueOutcome::Dropped,
                Err(mpsc::error::TrySendError::Closed(_)) => EnqueueOutcome::Closed,
            },
            WriteChannel::Latest(tx) => {
                if tx.borrow().is_some() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                match tx.send(Some(message)) {
                    Ok(()) => EnqueueOutcome::Sent,
                    Err(_) => EnqueueOutcome::Closed,
                }
            }
        }
    }

    /// Waits up to `deadline` for queue space before giving up. Used for the
    /// sender control channel (§5: "block briefly up to a fixed deadline,
    /// then close with slow_control_channel") and for non-orientation
    /// listener roles (§5: "close the connection with reason slow_consumer").
    pub async fn enqueue_with_deadline(
        &self,
        msg: &ServerMessage,
        deadline: Duration,
    ) -> EnqueueOutcome {
        let message = render(msg);
        match &self.channel {
            WriteChannel::Queued(tx) => {
                match tokio::time::timeout(deadline, tx.send(message)).await {
                    Ok(Ok(())) => EnqueueOutcome::Sent,
                    Ok(Err(_)) => EnqueueOutcome::Closed,
                    Err(_) => EnqueueOutcome::Dropped,
                }
            }
            WriteChannel::Latest(_) => self.enqueue(msg),
        }
    }

    pub fn force_close(&self) {
        self.close.notify_waiters();
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Drains a bounded write queue to the socket sink, one message at a time,
/// so a single Connection's sends are never interleaved or reordered (§5).
/// Also emits a `heartbeat` every `HEARTBEAT_INTERVAL` on its own, so a
/// Connection that is otherwise write-only (listener, bulk listener,
/// dashboard) keeps producing traffic the peer can use to tell "quiet but
/// alive" from "dead" apart — the read side no longer has to guess from
/// inbound silence (§5).
pub async fn run_queued_writer(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Message>) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // consume the immediate first tick
    loop {
        tokio::select! {
            message = rx.recv() => {
                let Some(message) = message else { break };
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if sink.send(heartbeat_message()).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

/// Drains a `watch` channel to the socket sink, sending only the latest
/// value each time it changes — never a backlog. The periodic heartbeat is
/// sent directly on the sink rather than through the watch slot, so it can
/// never coalesce away a pending orientation reading (or vice versa) the
/// way two enqueues onto the same single-slot channel would (§5, §6).
pub async fn run_latest_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: watch::Receiver<Option<Message>>,
) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let message = rx.borrow_and_update().clone();
                let Some(message) = message else {
                    continue;
                };
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if sink.send(heartbeat_message()).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use relay_protocol::{ServerMessage, TimestampOnly};

    fn msg() -> ServerMessage {
        ServerMessage::Promoted(TimestampOnly {
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn connection_ids_are_unique_and_monotonic() {
        let a = next_connection_id();
        let b = next_connection_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn queued_enqueue_reports_dropped_when_full() {
        let (handle, mut rx) = test_support::queued_handle("c1".to_owned(), Role::Listener, 1);
        assert!(matches!(handle.enqueue(&msg()), EnqueueOutcome::Sent));
        assert!(matches!(handle.enqueue(&msg()), EnqueueOutcome::Dropped));
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn latest_enqueue_always_succeeds_and_counts_overwrites_as_dropped() {
        let (handle, mut rx) =
            test_support::latest_handle("c2".to_owned(), Role::OrientationListener);
        assert!(matches!(handle.enqueue(&msg()), EnqueueOutcome::Sent));
        assert_eq!(handle.dropped_count(), 0);
        assert!(matches!(handle.enqueue(&msg()), EnqueueOutcome::Sent));
        assert_eq!(handle.dropped_count(), 1);
        assert!(rx.changed().await.is_ok());
    }

    #[tokio::test]
    async fn enqueue_with_deadline_times_out_on_a_full_queue() {
        let (handle, _rx) = test_support::queued_handle("c3".to_owned(), Role::Sender, 1);
        assert!(matches!(handle.enqueue(&msg()), EnqueueOutcome::Sent));
        let outcome = handle
            .enqueue_with_deadline(&msg(), Duration::from_millis(20))
            .await;
        assert!(matches!(outcome, EnqueueOutcome::Dropped));
    }

    #[test]
    fn heartbeat_renders_as_a_heartbeat_typed_frame() {
        let Message::Text(json) = heartbeat_message() else {
            panic!("heartbeat must render as a text frame");
        };
        assert!(json.contains("\"type\":\"heartbeat\""));
    }

    #[test]
    fn heartbeat_interval_is_well_inside_the_sender_idle_read_timeout() {
        assert!(HEARTBEAT_INTERVAL < crate::ws_common::IDLE_READ_TIMEOUT);
    }
}
