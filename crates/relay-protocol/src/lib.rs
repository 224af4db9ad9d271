// relay-protocol: wire message types for the sensor relay.
//
// All WebSocket messages use a top-level `type` field for discriminated
// deserialization. Field names are camelCase on the wire (the capture client
// and browser dashboards are JavaScript); Rust-side fields stay snake_case
// and are translated by `serde(rename_all = "camelCase")`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Shared sub-types (§3 SensorFrame / BulkItem fields)
// ---------------------------------------------------------------------------

/// A GPS fix as reported by the capture client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpsFix {
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<f64>,
    pub accuracy: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
}

/// A device orientation reading. `alpha` ∈ [0, 360), `beta` ∈ [-180, 180],
/// `gamma` ∈ [-90, 90] (validated by `validate::orientation`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Orientation {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    /// Compass heading, only ever populated on outbound `orientation_data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compass: Option<f64>,
}

/// Raw accelerometer reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Motion {
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
}

/// Local weather conditions attached by the capture client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Weather {
    pub temp: f64,
    pub humidity: f64,
    pub wind_speed: f64,
    pub wind_direction: f64,
    pub weather_code: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precipitation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_cover: Option<f64>,
}

/// One object-detection result, `bbox` as `[x, y, w, h]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub class: String,
    pub score: f64,
    pub bbox: Vec<f64>,
}

// ---------------------------------------------------------------------------
// Sender (capture client) -> server messages
// ---------------------------------------------------------------------------

/// Handshake sent once, immediately after the `/pocket-parrot` upgrade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// An inbound sensor frame. Carries at least one of `gps`, `orientation`,
/// `motion`, `weather`, `objectsDetected`, `photoBase64`, `audioBase64` —
/// enforced by the ingest pipeline's validation, not by the type itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorFrame {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gps: Option<GpsFix>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<Orientation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion: Option<Motion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weather: Option<Weather>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objects_detected: Option<Vec<DetectedObject>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_base64: Option<String>,
}

impl SensorFrame {
    /// True if at least one sensor subfield (beyond `timestamp`/`id`) is present.
    pub fn has_sensor_field(&self) -> bool {
        self.gps.is_some()
            || self.orientation.is_some()
            || self.motion.is_some()
            || self.weather.is_some()
            || self.objects_detected.is_some()
            || self.photo_base64.is_some()
            || self.audio_base64.is_some()
    }
}

/// All messages a sender connection may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SenderMessage {
    Handshake(Handshake),
    Data(SensorFrame),
}

/// All messages a dashboard connection may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DashboardRequest {
    #[serde(rename = "getStats")]
    GetStats,
}

// ---------------------------------------------------------------------------
// Derived fan-out payloads (§3 OrientationMessage / BulkItem / BulkBatch)
// ---------------------------------------------------------------------------

/// A BulkItem: a SensorFrame's non-orientation content, queued for the bulk
/// batcher. Never carries `orientation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkItem {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gps: Option<GpsFix>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion: Option<Motion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weather: Option<Weather>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objects_detected: Option<Vec<DetectedObject>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_base64: Option<String>,
}

impl BulkItem {
    /// True when the frame has no content beyond orientation/timestamp/id,
    /// i.e. there is nothing left to enqueue as a BulkItem.
    pub fn is_empty(&self) -> bool {
        self.gps.is_none()
            && self.motion.is_none()
            && self.weather.is_none()
            && self.objects_detected.is_none()
            && self.photo_base64.is_none()
            && self.audio_base64.is_none()
    }
}

/// A flush unit emitted by the bulk batcher. `1 <= batch_size <=
/// MAX_BATCH_SIZE` and `batch_size == data.len()` always (§8 batch bound).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkBatch {
    pub timestamp: DateTime<Utc>,
    pub batch_size: usize,
    pub data: Vec<BulkItem>,
}

// ---------------------------------------------------------------------------
// Stats snapshot (§3 StatsSnapshot, §4.7)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStat {
    pub id: String,
    pub connected_at: DateTime<Utc>,
    pub data_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_data: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub active_users: usize,
    pub max_users: usize,
    pub orientation_listeners: usize,
    pub bulk_data_listeners: usize,
    pub passive_listeners: usize,
    pub dashboards: usize,
    pub total_data_points: u64,
    pub data_rate_per_minute: u64,
    pub bulk_queue_size: usize,
    pub uptime_seconds: u64,
    pub users: Vec<UserStat>,
}

// ---------------------------------------------------------------------------
// Server -> client messages, one discriminated union for all five roles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampOnly {
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomePayload {
    pub timestamp: DateTime<Utc>,
    pub client_id: String,
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObserverModePayload {
    pub timestamp: DateTime<Utc>,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderChangedPayload {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_active_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedPayload {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserConnectionPayload {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataReceivedPayload {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub point_number: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsPayload {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub snapshot: StatsSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrientationDataPayload {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub orientation: Orientation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkListenerConnectedPayload {
    pub timestamp: DateTime<Utc>,
    pub batch_interval: u64,
    pub max_batch_size: usize,
}

/// Every message the server may push to any role, over any of the five
/// endpoints. Each handler only ever constructs the subset relevant to its
/// role (see `relay_server::ws`); the union is kept flat to mirror the
/// teacher's single `WsMessage` enum rather than five near-identical
/// smaller ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome(WelcomePayload),
    Promoted(TimestampOnly),
    ObserverMode(ObserverModePayload),
    SenderChanged(SenderChangedPayload),
    Ack(AckPayload),
    Rejected(RejectedPayload),
    Evicted(TimestampOnly),
    ServerShutdown(TimestampOnly),
    UserConnected(UserConnectionPayload),
    UserDisconnected(UserConnectionPayload),
    DataReceived(DataReceivedPayload),
    Error(ErrorPayload),
    Stats(StatsPayload),
    ListenerConnected(TimestampOnly),
    SensorData(SensorFrame),
    OrientationListenerConnected(TimestampOnly),
    OrientationData(OrientationDataPayload),
    BulkListenerConnected(BulkListenerConnectedPayload),
    BulkDataBatch(BulkBatch),
    /// Sent on a fixed interval to every server->client-only role so a
    /// healthy but otherwise-quiet Connection stays distinguishable from a
    /// dead one (§5).
    Heartbeat(TimestampOnly),
}

impl ServerMessage {
    /// Render to the wire format. Never fails: every variant here is built
    /// from plain data, not user input.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ServerMessage always serializes")
    }
}

/// Frozen close/rejection reason codes (§4, §7). Distinct from the internal
/// error taxonomy in `relay_server::error`: these describe *why a
/// connection ended or a frame was refused*, a value that crosses the wire.
pub mod reason_codes {
    pub const UNKNOWN_PATH: &str = "unknown_path";
    pub const CAPACITY_REACHED_NO_EVICTABLE: &str = "capacity_reached_no_evictable";
    pub const NOT_ACTIVE: &str = "not_active";
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const SLOW_CONSUMER: &str = "slow_consumer";
    pub const SLOW_CONTROL_CHANNEL: &str = "slow_control_channel";
    pub const PROTOCOL_ERROR: &str = "protocol_error";
}
