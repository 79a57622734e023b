use crate::connection::ConnectionHandle;
use crate::errors::{Error, Result};
use crate::metrics::{COMMANDS_PUBLISHED_TOTAL, COMMANDS_UNPUBLISHED_TOTAL};
use crate::model::{CommandKind, CommandStatus, ControlCommand, SYSTEM_ACTOR};
use crate::store::TelemetryStore;
use crate::topics::command_topic;
use crate::validate::{clamp_servo_angle, coerce_bool, parse_angle};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Serialize)]
struct ServoPayload<'a> {
    device_id: &'a str,
    target_angle: i32,
    command_by: &'a str,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct WaterPayload<'a> {
    device_id: &'a str,
    water_state: bool,
    command_by: &'a str,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub command: ControlCommand,
    /// False when the broker was unavailable; the command is still recorded.
    pub published: bool,
}

/// Validates operator commands, publishes them to the device and keeps the
/// audit trail.
#[derive(Clone)]
pub struct CommandPublisher {
    connection: ConnectionHandle,
    store: Arc<dyn TelemetryStore>,
}

impl CommandPublisher {
    pub fn new(connection: ConnectionHandle, store: Arc<dyn TelemetryStore>) -> Self {
        Self { connection, store }
    }

    pub async fn send_servo(
        &self,
        device_id: &str,
        angle: &Value,
        issued_by: Option<&str>,
    ) -> Result<CommandOutcome> {
        require_device(device_id)?;
        let target_angle = clamp_servo_angle(parse_angle(angle)?);
        let issued_by = actor(issued_by);
        let issued_at = Utc::now();

        let payload = serde_json::to_vec(&ServoPayload {
            device_id,
            target_angle,
            command_by: issued_by,
            timestamp: issued_at,
        })?;

        let command = ControlCommand {
            id: None,
            device_id: device_id.to_string(),
            kind: CommandKind::Servo,
            target_value: angle.clone(),
            final_value: Value::from(target_angle),
            issued_by: issued_by.to_string(),
            status: CommandStatus::Sent,
            issued_at,
        };

        self.publish_and_record(command, payload).await
    }

    pub async fn send_water(
        &self,
        device_id: &str,
        state: &Value,
        issued_by: Option<&str>,
    ) -> Result<CommandOutcome> {
        require_device(device_id)?;
        let water_state = coerce_bool(state);
        let issued_by = actor(issued_by);
        let issued_at = Utc::now();

        let payload = serde_json::to_vec(&WaterPayload {
            device_id,
            water_state,
            command_by: issued_by,
            timestamp: issued_at,
        })?;

        let command = ControlCommand {
            id: None,
            device_id: device_id.to_string(),
            kind: CommandKind::Water,
            target_value: state.clone(),
            final_value: Value::Bool(water_state),
            issued_by: issued_by.to_string(),
            status: CommandStatus::Sent,
            issued_at,
        };

        self.publish_and_record(command, payload).await
    }

    /// Publish failures are soft: they are logged and reported through
    /// `published`, and the command is recorded either way.
    async fn publish_and_record(
        &self,
        command: ControlCommand,
        payload: Vec<u8>,
    ) -> Result<CommandOutcome> {
        let topic = command_topic(&command.device_id, command.kind);

        let published = match self.connection.publish(&topic, payload).await {
            Ok(()) => {
                info!(
                    "Published {} command {} to {}",
                    command.kind, command.final_value, topic
                );
                COMMANDS_PUBLISHED_TOTAL.inc();
                true
            }
            Err(Error::PublishUnavailable) => {
                warn!(
                    "Broker not connected, {} command for {} not published",
                    command.kind, command.device_id
                );
                COMMANDS_UNPUBLISHED_TOTAL.inc();
                false
            }
            Err(e) => {
                error!("Failed to publish to {}: {}", topic, e);
                COMMANDS_UNPUBLISHED_TOTAL.inc();
                false
            }
        };

        let command = self.store.append_command(command).await?;
        Ok(CommandOutcome { command, published })
    }
}

fn require_device(device_id: &str) -> Result<()> {
    if device_id.trim().is_empty() {
        return Err(Error::Validation("device_id is required".to_string()));
    }
    Ok(())
}

fn actor(issued_by: Option<&str>) -> &str {
    issued_by
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(SYSTEM_ACTOR)
}
