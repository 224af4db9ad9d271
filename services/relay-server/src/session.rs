use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use relay_protocol::{
    ObserverModePayload, RejectedPayload, SenderChangedPayload, ServerMessage, TimestampOnly,
    UserStat, WelcomePayload,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

use crate::connection::{ConnectionHandle, EnqueueOutcome};
use crate::stats::Stats;

/// What arrives on a fresh `/pocket-parrot` upgrade after its handshake.
pub struct NewSender {
    pub handle: Arc<ConnectionHandle>,
    pub username: Option<String>,
    pub device_id: Option<String>,
}

/// The `{connect, disconnect, frame_received, tick}` events of §4.3's
/// implementation note. One task owns `SenderTable` exclusively and
/// processes these serially — no other task ever mutates sender state.
pub enum SessionEvent {
    Connect(NewSender),
    Disconnect { id: String },
    DataReceived { id: String },
    /// Drain coordinator's shutdown step (§4.8): sends `server_shutdown` to
    /// every live sender, force-closes them, and replies once done so the
    /// coordinator can order "notify senders" before "close transports".
    Shutdown(oneshot::Sender<()>),
}

struct SenderRecord {
    handle: Arc<ConnectionHandle>,
    username: Option<String>,
    data_count: u64,
    last_data_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct SenderTable {
    active_sender_id: Option<String>,
    observers: VecDeque<String>,
    senders: HashMap<String, SenderRecord>,
}

impl SenderTable {
    fn len(&self) -> usize {
        self.senders.len()
    }

    fn oldest_id(&self) -> Option<String> {
        self.senders
            .values()
            .min_by_key(|r| r.handle.connected_at)
            .map(|r| r.handle.id.clone())
    }
}

/// A cheap, read-only view of the sender population, published by the
/// session task after every transition. Readers (the ingest fast-path
/// active-sender check, the stats broadcaster) never touch the session
/// task's lock-free internal state directly (§9 "no component holds two of
/// these locks simultaneously").
#[derive(Clone, Default)]
pub struct SessionSnapshot {
    pub active_sender_id: Option<String>,
    pub sender_count: usize,
    pub users: Vec<UserStat>,
}

/// Handle held by the rest of the process: a sender to feed events in, and
/// a `watch` receiver for the latest snapshot.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionEvent>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    pub fn submit(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.snapshot.borrow().active_sender_id.as_deref() == Some(id)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }
}

/// Spawns the session manager task and returns a handle to it. `max_senders`
/// and `sender_timeout` come from `Config` (§4.9); `stats` is notified of
/// connect/disconnect so dashboards see `user_connected`/`user_disconnected`
/// without the session task needing to know about the registry.
pub fn spawn(max_senders: usize, sender_timeout: Duration, stats: Arc<Stats>) -> SessionHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
    tokio::spawn(run(rx, snapshot_tx, max_senders, sender_timeout, stats));
    SessionHandle {
        tx,
        snapshot: snapshot_rx,
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<SessionEvent>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    max_senders: usize,
    sender_timeout: Duration,
    stats: Arc<Stats>,
) {
    let mut table = SenderTable::default();
    let mut timeout_tick = tokio::time::interval(Duration::from_secs(1));
    timeout_tick.tick().await;

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => handle_event(&mut table, event, max_senders, &stats).await,
                    None => break,
                }
            }
            _ = timeout_tick.tick() => {
                check_timeout(&mut table, sender_timeout, &stats).await;
            }
        }
        let snapshot = publish(&table, &snapshot_tx);
        stats.observe_session(snapshot).await;
    }
}

fn publish(table: &SenderTable, snapshot_tx: &watch::Sender<SessionSnapshot>) -> SessionSnapshot {
    let users = table
        .senders
        .values()
        .map(|r| UserStat {
            id: r.handle.id.clone(),
            connected_at: r.handle.connected_at,
            data_count: r.data_count,
            last_data: r.last_data_at,
            username: r.username.clone(),
        })
        .collect::<Vec<_>>();
    let snapshot = SessionSnapshot {
        active_sender_id: table.active_sender_id.clone(),
        sender_count: table.len(),
        users,
    };
    let _ = snapshot_tx.send(snapshot.clone());
    snapshot
}

async fn handle_event(table: &mut SenderTable, event: SessionEvent, max_senders: usize, stats: &Arc<Stats>) {
    match event {
        SessionEvent::Connect(new_sender) => connect(table, new_sender, max_senders, stats).await,
        SessionEvent::Disconnect { id } => disconnect(table, &id, stats).await,
        SessionEvent::DataReceived { id } => {
            if table.active_sender_id.as_deref() == Some(id.as_str()) {
                let now = Utc::now();
                if let Some(record) = table.senders.get_mut(&id) {
                    record.data_count += 1;
                    record.last_data_at = Some(now);
                }
            }
        }
        SessionEvent::Shutdown(reply) => {
            for record in table.senders.values() {
                send(&record.handle, &ServerMessage::ServerShutdown(TimestampOnly { timestamp: Utc::now() })).await;
                record.handle.force_close();
            }
            let _ = reply.send(());
        }
    }
}

async fn connect(table: &mut SenderTable, new_sender: NewSender, max_senders: usize, stats: &Arc<Stats>) {
    let NewSender {
        handle,
        username,
        device_id: _,
    } = new_sender;
    let id = handle.id.clone();

    if table.len() >= max_senders {
        if let Some(evict_id) = table.oldest_id() {
            evict(table, &evict_id, stats).await;
        }
    }

    table.senders.insert(
        id.clone(),
        SenderRecord {
            handle: handle.clone(),
            username: username.clone(),
            data_count: 0,
            last_data_at: None,
        },
    );
    stats.user_connected(&id, username.as_deref()).await;

    if table.active_sender_id.is_none() {
        promote(table, &id).await;
    } else {
        table.observers.push_back(id.clone());
        let position = table.observers.len() - 1;
        send(&handle, &ServerMessage::ObserverMode(ObserverModePayload {
            timestamp: Utc::now(),
            position,
        }))
        .await;
    }
}

async fn promote(table: &mut SenderTable, id: &str) {
    table.active_sender_id = Some(id.to_owned());
    table.observers.retain(|o| o != id);
    if let Some(record) = table.senders.get_mut(id) {
        record.last_data_at = Some(Utc::now());
        send(&record.handle, &ServerMessage::Promoted(TimestampOnly { timestamp: Utc::now() })).await;
    }
    broadcast_sender_changed(table, Some(id.to_owned())).await;
}

async fn broadcast_sender_changed(table: &SenderTable, new_active_id: Option<String>) {
    let msg = ServerMessage::SenderChanged(SenderChangedPayload {
        timestamp: Utc::now(),
        new_active_id: new_active_id.clone(),
    });
    for (sid, record) in &table.senders {
        if Some(sid.as_str()) != new_active_id.as_deref() {
            send(&record.handle, &msg).await;
        }
    }
}

async fn evict(table: &mut SenderTable, id: &str, stats: &Arc<Stats>) {
    let Some(record) = table.senders.get(id) else { return };
    send(&record.handle, &ServerMessage::Evicted(TimestampOnly { timestamp: Utc::now() })).await;
    record.handle.force_close();
    info!(connection_id = %id, "sender evicted at capacity");
    remove(table, id, stats).await;
}

async fn disconnect(table: &mut SenderTable, id: &str, stats: &Arc<Stats>) {
    remove(table, id, stats).await;
}

async fn remove(table: &mut SenderTable, id: &str, stats: &Arc<Stats>) {
    if table.senders.remove(id).is_none() {
        return;
    }
    table.observers.retain(|o| o != id);
    stats.user_disconnected(id).await;

    if table.active_sender_id.as_deref() == Some(id) {
        table.active_sender_id = None;
        if let Some(next_id) = table.observers.pop_front() {
            promote(table, &next_id).await;
        } else {
            broadcast_sender_changed(table, None).await;
        }
    }
}

async fn check_timeout(table: &mut SenderTable, sender_timeout: Duration, stats: &Arc<Stats>) {
    let Some(active_id) = table.active_sender_id.clone() else { return };
    let Some(record) = table.senders.get(&active_id) else { return };
    let Some(last_data_at) = record.last_data_at else { return };
    let idle = Utc::now().signed_duration_since(last_data_at);
    if idle.to_std().unwrap_or_default() > sender_timeout {
        warn!(connection_id = %active_id, "active sender timed out, demoting");
        record.handle.force_close();
        remove(table, &active_id, stats).await;
    }
}

/// Rejects a `data` frame from a sender that is not currently active
/// (§4.4: "frames from pending/observer senders are acknowledged with
/// `rejected {reason: not_active}` and discarded").
pub async fn reject_not_active(handle: &ConnectionHandle) {
    send(
        handle,
        &ServerMessage::Rejected(RejectedPayload {
            timestamp: Utc::now(),
            reason: relay_protocol::reason_codes::NOT_ACTIVE.to_owned(),
        }),
    )
    .await;
}

pub async fn send_welcome(handle: &ConnectionHandle) {
    send(
        handle,
        &ServerMessage::Welcome(WelcomePayload {
            timestamp: Utc::now(),
            client_id: handle.id.clone(),
            server_time: Utc::now(),
        }),
    )
    .await;
}

/// Best-effort control-frame send with the §5 sender back-pressure policy:
/// block briefly, then give up silently. Send failures on control frames
/// are logged, never fatal to the transition itself (§4.3 failure semantics).
async fn send(handle: &ConnectionHandle, msg: &ServerMessage) {
    let outcome = handle
        .enqueue_with_deadline(msg, Duration::from_millis(200))
        .await;
    if matches!(outcome, EnqueueOutcome::Dropped | EnqueueOutcome::Closed) {
        warn!(connection_id = %handle.id, "control frame send failed or timed out");
    }
}
