use crate::errors::{Error, Result};
use crate::model::{CommandKind, CommandStatus, ControlCommand, TelemetryRecord};
use crate::store::TelemetryStore;
use crate::validate::{clamp_servo_angle, coerce_bool, parse_angle, parse_timestamp, validate};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Body published by devices on `sensor/<device_id>/data`
#[derive(Debug, Deserialize)]
struct SensorPayload {
    device_id: Option<String>,
    temperature: Option<f64>,
    humidity: Option<f64>,
    pressure: Option<f64>,
    servo_state: Option<Value>,
    water_state: Option<Value>,
    timestamp: Option<Value>,
}

/// Body published by devices on `servo/<id>/status` and `water/<id>/status`.
/// Firmware variants disagree on field names, so all of them are accepted.
#[derive(Debug, Deserialize)]
struct StatusPayload {
    device_id: Option<String>,
    final_angle: Option<Value>,
    angle: Option<Value>,
    target_angle: Option<Value>,
    water_state: Option<Value>,
    state: Option<Value>,
    status: Option<String>,
}

/// Turns a raw sensor payload into a validated record for `device_id`.
pub fn normalize(
    device_id: &str,
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> Result<TelemetryRecord> {
    let body: SensorPayload = serde_json::from_slice(payload)
        .map_err(|e| Error::Parse(format!("JSON parse error: {}", e)))?;

    warn_on_mismatch(device_id, body.device_id.as_deref());

    let servo_state = match &body.servo_state {
        None | Some(Value::Null) => 0,
        Some(value) => clamp_servo_angle(parse_angle(value)?),
    };

    let timestamp = match &body.timestamp {
        None | Some(Value::Null) => received_at,
        Some(value) => parse_timestamp(value)?,
    };

    let record = TelemetryRecord {
        id: None,
        device_id: device_id.to_string(),
        temperature: body.temperature,
        humidity: body.humidity,
        pressure: body.pressure,
        servo_state,
        water_state: body.water_state.as_ref().map_or(false, coerce_bool),
        timestamp,
    };

    validate(&record)?;
    Ok(record)
}

fn warn_on_mismatch(topic_device: &str, payload_device: Option<&str>) {
    if let Some(payload_device) = payload_device {
        if payload_device != topic_device {
            warn!(
                "Payload device_id {} differs from topic device {}, using topic",
                payload_device, topic_device
            );
        }
    }
}

/// Builds the audit entry for a device-side acknowledgment.
pub fn normalize_ack(
    kind: CommandKind,
    device_id: &str,
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> Result<ControlCommand> {
    let body: StatusPayload = serde_json::from_slice(payload)
        .map_err(|e| Error::Parse(format!("JSON parse error: {}", e)))?;

    warn_on_mismatch(device_id, body.device_id.as_deref());

    let (target_value, final_value) = match kind {
        CommandKind::Servo => {
            let reported = body
                .final_angle
                .as_ref()
                .or(body.angle.as_ref())
                .ok_or_else(|| Error::Parse("servo status without angle".to_string()))?;
            let final_angle = Value::from(clamp_servo_angle(parse_angle(reported)?));
            let target = body.target_angle.clone().unwrap_or_else(|| final_angle.clone());
            (target, final_angle)
        }
        CommandKind::Water => {
            let reported = body
                .water_state
                .as_ref()
                .or(body.state.as_ref())
                .ok_or_else(|| Error::Parse("water status without state".to_string()))?;
            let state = Value::Bool(coerce_bool(reported));
            (reported.clone(), state)
        }
    };

    let status = match body.status.as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some("error") | Some("failed") | Some("failure") => CommandStatus::Failed,
        _ => CommandStatus::Acked,
    };

    Ok(ControlCommand {
        id: None,
        device_id: device_id.to_string(),
        kind,
        target_value,
        final_value,
        issued_by: device_id.to_string(),
        status,
        issued_at: received_at,
    })
}

/// Persists inbound telemetry and keeps the device directory current.
#[derive(Clone)]
pub struct TelemetryIngestor {
    store: Arc<dyn TelemetryStore>,
}

impl TelemetryIngestor {
    pub fn new(store: Arc<dyn TelemetryStore>) -> Self {
        Self { store }
    }

    /// Appends the record and upserts the device. The upsert is attempted
    /// even when the append fails; the first failure is returned.
    pub async fn ingest(&self, device_id: &str, payload: &[u8]) -> Result<TelemetryRecord> {
        let now = Utc::now();
        let record = normalize(device_id, payload, now)?;

        let appended = self.store.append_telemetry(record).await;
        let upserted = self.store.upsert_device(device_id, now).await;

        let stored = appended?;
        upserted?;

        debug!("Stored telemetry for {} at {}", stored.device_id, stored.timestamp);
        Ok(stored)
    }

    pub async fn record_ack(
        &self,
        kind: CommandKind,
        device_id: &str,
        payload: &[u8],
    ) -> Result<ControlCommand> {
        let ack = normalize_ack(kind, device_id, payload, Utc::now())?;
        self.store.append_command(ack).await
    }
}
