use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;

use relay_protocol::{BulkItem, Orientation, OrientationDataPayload, SensorFrame, ServerMessage};
use tracing::warn;

use crate::batcher::BatcherHandle;
use crate::connection::{ConnectionHandle, Role};
use crate::error::RelayError;
use crate::orientation;
use crate::registry::Registry;
use crate::stats::Stats;

/// Invoked synchronously after a frame is accepted (§4.4 step 5). The
/// default is a no-op; `AppState` accepts any `Arc<dyn IngestHook>` so a
/// storage engine or analytics sink can observe the stream without the
/// relay depending on it (§6). A panicking hook is caught at the call site
/// and logged, never propagated — the trait itself reports nothing back.
pub trait IngestHook: Send + Sync {
    fn on_frame(&self, sender_id: &str, frame: &SensorFrame);
}

pub struct NoopIngestHook;

impl IngestHook for NoopIngestHook {
    fn on_frame(&self, _sender_id: &str, _frame: &SensorFrame) {}
}

/// Hard rejections applied per-frame (§4.4). Parsing a recognized `type` is
/// handled by `serde` at the WebSocket boundary; this only covers the
/// structural and range checks that survive successful deserialization.
pub fn validate(frame: &SensorFrame) -> Result<(), RelayError> {
    if !frame.has_sensor_field() {
        return Err(RelayError::ValidationFailed {
            reason: "frame carries no sensor field".to_owned(),
        });
    }
    if let Some(orientation) = &frame.orientation {
        validate_orientation(orientation)?;
    }
    for value in numeric_fields(frame) {
        if !value.is_finite() {
            return Err(RelayError::ValidationFailed {
                reason: "non-finite numeric field".to_owned(),
            });
        }
    }
    Ok(())
}

fn validate_orientation(o: &Orientation) -> Result<(), RelayError> {
    if !(0.0..360.0).contains(&o.alpha) {
        return Err(RelayError::ValidationFailed {
            reason: "orientation.alpha out of range [0, 360)".to_owned(),
        });
    }
    if !(-180.0..=180.0).contains(&o.beta) {
        return Err(RelayError::ValidationFailed {
            reason: "orientation.beta out of range [-180, 180]".to_owned(),
        });
    }
    if !(-90.0..=90.0).contains(&o.gamma) {
        return Err(RelayError::ValidationFailed {
            reason: "orientation.gamma out of range [-90, 90]".to_owned(),
        });
    }
    Ok(())
}

fn numeric_fields(frame: &SensorFrame) -> Vec<f64> {
    let mut values = Vec::new();
    if let Some(gps) = &frame.gps {
        values.extend([gps.lat, gps.lon, gps.accuracy]);
        values.extend(gps.alt);
        values.extend(gps.speed);
        values.extend(gps.heading);
    }
    if let Some(motion) = &frame.motion {
        values.extend([motion.ax, motion.ay, motion.az]);
    }
    if let Some(weather) = &frame.weather {
        values.extend([
            weather.temp,
            weather.humidity,
            weather.wind_speed,
            weather.wind_direction,
        ]);
        values.extend(weather.precipitation);
        values.extend(weather.cloud_cover);
    }
    if let Some(objects) = &frame.objects_detected {
        for object in objects {
            values.push(object.score);
            values.extend(object.bbox.iter().copied());
        }
    }
    values
}

/// Builds the orientation payload for the fast path (§4.4 step 3), if the
/// frame carries one.
pub fn split_orientation(
    sender_id: &str,
    username: Option<&str>,
    frame: &SensorFrame,
) -> Option<OrientationDataPayload> {
    frame.orientation.as_ref().map(|orientation| OrientationDataPayload {
        timestamp: frame.timestamp,
        user_id: sender_id.to_owned(),
        username: username.map(ToOwned::to_owned),
        orientation: orientation.clone(),
    })
}

/// Builds the bulk item for the batcher (§4.4 step 4) from everything in the
/// frame except orientation. Returns `None` when nothing is left to enqueue
/// (an orientation-only frame).
pub fn split_bulk_item(
    sender_id: &str,
    username: Option<&str>,
    frame: &SensorFrame,
) -> Option<BulkItem> {
    let item = BulkItem {
        timestamp: frame.timestamp,
        user_id: sender_id.to_owned(),
        username: username.map(ToOwned::to_owned),
        gps: frame.gps.clone(),
        motion: frame.motion.clone(),
        weather: frame.weather.clone(),
        objects_detected: frame.objects_detected.clone(),
        photo_base64: frame.photo_base64.clone(),
        audio_base64: frame.audio_base64.clone(),
    };
    if item.is_empty() {
        None
    } else {
        Some(item)
    }
}

/// Everything the pipeline needs to drive a frame through steps 1-6 of
/// §4.4. Borrowed rather than bundled into `AppState` directly, so the unit
/// tests below can construct a minimal one without a full server.
pub struct IngestContext<'a> {
    pub registry: &'a Registry,
    pub batcher: &'a BatcherHandle,
    pub stats: &'a Stats,
    pub ingest_hook: &'a (dyn IngestHook + 'a),
}

/// Drives one accepted `data` frame through validation, the orientation
/// fast path, the bulk batcher, the ingest hook, and the stats broadcaster
/// (§4.4 steps 1-6). Returns the per-frame `ack`'s `received` echo — the
/// sender connection sends the actual `ack` message itself.
pub async fn accept(
    ctx: &IngestContext<'_>,
    handle: &ConnectionHandle,
    username: Option<&str>,
    frame: SensorFrame,
) -> Result<(), RelayError> {
    validate(&frame)?;

    ctx.registry
        .broadcast(Role::Listener, &ServerMessage::SensorData(frame.clone()))
        .await;

    if let Some(payload) = split_orientation(&handle.id, username, &frame) {
        orientation::dispatch(ctx.registry, payload).await;
    }
    if let Some(item) = split_bulk_item(&handle.id, username, &frame) {
        ctx.batcher.enqueue(item);
    }

    let point_number = handle.data_count.fetch_add(1, Ordering::Relaxed) + 1;

    let hook = ctx.ingest_hook;
    let id = &handle.id;
    if std::panic::catch_unwind(AssertUnwindSafe(|| hook.on_frame(id, &frame))).is_err() {
        warn!(connection_id = %handle.id, "ingest hook panicked");
    }

    ctx.stats.data_received(&handle.id, point_number).await;
    Ok(())
}
