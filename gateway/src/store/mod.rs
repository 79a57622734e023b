mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use crate::config::{Config, StorageBackend};
use crate::errors::Result;
use crate::model::{ControlCommand, Device, TelemetryRecord};
use crate::state::latest_per_device;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

/// Persistence collaborator used by the ingestion, command and query paths.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    async fn append_telemetry(&self, record: TelemetryRecord) -> Result<TelemetryRecord>;

    /// Marks the device online and advances `last_seen`, creating the
    /// directory entry on first sight.
    async fn upsert_device(&self, device_id: &str, seen_at: DateTime<Utc>) -> Result<()>;

    async fn append_command(&self, command: ControlCommand) -> Result<ControlCommand>;

    /// Telemetry for one device, or for all devices, in no particular order.
    async fn scan_telemetry(&self, device_id: Option<&str>) -> Result<Vec<TelemetryRecord>>;

    /// Latest record per device. Defaults to a linear scan over
    /// `scan_telemetry`; backends can override with a server-side query.
    async fn query_latest_telemetry(
        &self,
        device_id: Option<&str>,
    ) -> Result<Vec<TelemetryRecord>> {
        let records = self.scan_telemetry(device_id).await?;
        Ok(latest_per_device(records))
    }

    /// Newest first.
    async fn query_telemetry_history(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<TelemetryRecord>>;

    /// Ordered by `last_seen` descending.
    async fn list_devices(&self) -> Result<Vec<Device>>;
}

/// Opens the backend selected by configuration.
pub async fn open(config: &Config) -> Result<Arc<dyn TelemetryStore>> {
    match config.storage {
        StorageBackend::Postgres => {
            let store = PostgresStore::connect(&config.database_url).await?;
            Ok(Arc::new(store))
        }
        StorageBackend::Memory => {
            info!("Using in-memory storage, data will not survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
