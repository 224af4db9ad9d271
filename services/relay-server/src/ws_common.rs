use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use tokio::sync::Notify;

/// How long the sender's read loop waits for the next frame before treating
/// the Connection as idle and closing it (§5 "each read has an idle read
/// timeout"). Distinct from `SENDER_TIMEOUT`, which the Session Manager
/// enforces against the active sender's last *accepted data frame*, not
/// against the transport's read cadence. The other four roles are
/// server->client only (or only optionally receive inbound text, like the
/// dashboard's `getStats`) and don't use this — an idle *read* side doesn't
/// mean a dead Connection for them, so they rely on the writer task's
/// `HEARTBEAT_INTERVAL` (`connection.rs`) instead. See `run_until_closed`.
pub const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(90);

/// Waits up to `timeout` for the next frame and returns its text payload.
/// Anything else — a ping/pong, a close frame, a transport error, or the
/// timeout itself — is treated uniformly as "nothing usable"; callers close
/// the Connection on `None` rather than branching on why.
pub async fn recv_text(stream: &mut SplitStream<WebSocket>, timeout: Duration) -> Option<String> {
    match tokio::time::timeout(timeout, stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => Some(text.to_string()),
        _ => None,
    }
}

/// How many protocol violations (malformed JSON, unrecognized request) a
/// non-sender connection may rack up before it's closed (§7: "repeated
/// violations within a short window close the Connection"). Senders get a
/// `rejected` reply per violation instead, since they're otherwise
/// well-behaved capture clients; this threshold is for read-only roles where
/// there's no reply channel worth sending on.
const MAX_PROTOCOL_VIOLATIONS: u32 = 5;

/// Counts protocol violations on one Connection. Not reset on a timer — a
/// well-behaved client sends at most one `getStats`-shaped request per
/// round-trip, so any real client stays far below the threshold regardless
/// of window length.
#[derive(Default)]
pub struct ViolationTracker(u32);

impl ViolationTracker {
    /// Records one violation; returns `true` once the threshold is exceeded
    /// and the caller should close the Connection.
    pub fn record(&mut self) -> bool {
        self.0 += 1;
        self.0 > MAX_PROTOCOL_VIOLATIONS
    }
}

/// Runs until either the Connection's close signal fires or the read side
/// reports the peer is actually gone (a close frame, a transport error, or
/// the stream ending). Used by the read-only downstream roles (listener,
/// orientation, bulk), which only need a read loop to detect disconnects —
/// any inbound text is discarded. Unlike `recv_text`, this never times out
/// on inbound silence: these roles are server->client only, so there is no
/// reason to expect inbound text at all, and the writer task's own
/// `HEARTBEAT_INTERVAL` ticks (`connection.rs`) are what keeps a healthy,
/// otherwise-quiet Connection distinguishable from a dead one.
pub async fn run_until_closed(stream: &mut SplitStream<WebSocket>, close: &Notify) {
    loop {
        tokio::select! {
            _ = close.notified() => return,
            frame = stream.next() => {
                match frame {
                    None | Some(Ok(Message::Close(_))) | Some(Err(_)) => return,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
