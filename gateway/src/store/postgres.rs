use super::TelemetryStore;
use crate::errors::Result;
use crate::model::{ControlCommand, Device, TelemetryRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

const TELEMETRY_COLUMNS: &str =
    "id, device_id, temperature, humidity, pressure, servo_state, water_state, ts AS timestamp";

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!("Connecting to database...");
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;

        info!("Database connection established");
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Migrations completed");

        Ok(Self { pool })
    }
}

#[async_trait]
impl TelemetryStore for PostgresStore {
    async fn append_telemetry(&self, mut record: TelemetryRecord) -> Result<TelemetryRecord> {
        let query = r#"
            INSERT INTO telemetry (device_id, temperature, humidity, pressure, servo_state, water_state, ts)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#;

        let id: i64 = sqlx::query_scalar::<_, i64>(query)
            .bind(&record.device_id)
            .bind(record.temperature)
            .bind(record.humidity)
            .bind(record.pressure)
            .bind(record.servo_state)
            .bind(record.water_state)
            .bind(record.timestamp)
            .fetch_one(&self.pool)
            .await?;

        record.id = Some(id);
        Ok(record)
    }

    async fn upsert_device(&self, device_id: &str, seen_at: DateTime<Utc>) -> Result<()> {
        let query = r#"
            INSERT INTO devices (device_id, display_name, last_seen, is_online)
            VALUES ($1, $1, $2, TRUE)
            ON CONFLICT (device_id) DO UPDATE
            SET last_seen = GREATEST(devices.last_seen, EXCLUDED.last_seen),
                is_online = TRUE
            "#;

        sqlx::query(query)
            .bind(device_id)
            .bind(seen_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn append_command(&self, mut command: ControlCommand) -> Result<ControlCommand> {
        let query = r#"
            INSERT INTO control_commands (device_id, kind, target_value, final_value, issued_by, status, issued_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#;

        let id: i64 = sqlx::query_scalar::<_, i64>(query)
            .bind(&command.device_id)
            .bind(command.kind.as_str())
            .bind(command.target_value.to_string())
            .bind(command.final_value.to_string())
            .bind(&command.issued_by)
            .bind(command.status.as_str())
            .bind(command.issued_at)
            .fetch_one(&self.pool)
            .await?;

        command.id = Some(id);
        Ok(command)
    }

    async fn scan_telemetry(&self, device_id: Option<&str>) -> Result<Vec<TelemetryRecord>> {
        let records = match device_id {
            Some(device_id) => {
                let query = format!(
                    "SELECT {} FROM telemetry WHERE device_id = $1",
                    TELEMETRY_COLUMNS
                );
                sqlx::query_as::<_, TelemetryRecord>(&query)
                    .bind(device_id)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = format!("SELECT {} FROM telemetry", TELEMETRY_COLUMNS);
                sqlx::query_as::<_, TelemetryRecord>(&query)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        Ok(records)
    }

    async fn query_telemetry_history(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<TelemetryRecord>> {
        let query = format!(
            "SELECT {} FROM telemetry WHERE device_id = $1 ORDER BY ts DESC, id DESC LIMIT $2",
            TELEMETRY_COLUMNS
        );

        let records = sqlx::query_as::<_, TelemetryRecord>(&query)
            .bind(device_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        let devices = sqlx::query_as::<_, Device>(
            "SELECT device_id, display_name, last_seen, is_online FROM devices ORDER BY last_seen DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(devices)
    }
}
