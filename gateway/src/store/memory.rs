use super::TelemetryStore;
use crate::errors::Result;
use crate::model::{ControlCommand, Device, TelemetryRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    next_id: i64,
    telemetry: Vec<TelemetryRecord>,
    devices: HashMap<String, Device>,
    commands: Vec<ControlCommand>,
}

impl Tables {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-process store for running without a database, and for tests.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn commands(&self) -> Vec<ControlCommand> {
        self.tables.read().await.commands.clone()
    }
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn append_telemetry(&self, mut record: TelemetryRecord) -> Result<TelemetryRecord> {
        let mut tables = self.tables.write().await;
        record.id = Some(tables.allocate_id());
        tables.telemetry.push(record.clone());
        Ok(record)
    }

    async fn upsert_device(&self, device_id: &str, seen_at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.write().await;
        let device = tables
            .devices
            .entry(device_id.to_string())
            .or_insert_with(|| Device {
                device_id: device_id.to_string(),
                display_name: device_id.to_string(),
                last_seen: seen_at,
                is_online: true,
            });
        device.last_seen = device.last_seen.max(seen_at);
        device.is_online = true;
        Ok(())
    }

    async fn append_command(&self, mut command: ControlCommand) -> Result<ControlCommand> {
        let mut tables = self.tables.write().await;
        command.id = Some(tables.allocate_id());
        tables.commands.push(command.clone());
        Ok(command)
    }

    async fn scan_telemetry(&self, device_id: Option<&str>) -> Result<Vec<TelemetryRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .telemetry
            .iter()
            .filter(|r| device_id.map_or(true, |id| r.device_id == id))
            .cloned()
            .collect())
    }

    async fn query_telemetry_history(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<TelemetryRecord>> {
        let mut records = self.scan_telemetry(Some(device_id)).await?;
        records.sort_by(|a, b| (b.timestamp, b.id).cmp(&(a.timestamp, a.id)));
        records.truncate(limit);
        Ok(records)
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        let tables = self.tables.read().await;
        let mut devices: Vec<Device> = tables.devices.values().cloned().collect();
        devices.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn record(device_id: &str, minute: u32) -> TelemetryRecord {
        TelemetryRecord {
            id: None,
            device_id: device_id.to_string(),
            temperature: Some(20.0),
            humidity: Some(50.0),
            pressure: None,
            servo_state: 0,
            water_state: false,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_append_assigns_ids() {
        let store = MemoryStore::new();
        let first = store.append_telemetry(record("a", 0)).await.unwrap();
        let second = store.append_telemetry(record("a", 1)).await.unwrap();
        assert_eq!(first.id, Some(1));
        assert_eq!(second.id, Some(2));
    }

    #[tokio::test]
    async fn test_history_is_newest_first_and_limited() {
        let store = MemoryStore::new();
        for minute in [5, 0, 9, 3] {
            store.append_telemetry(record("a", minute)).await.unwrap();
        }
        store.append_telemetry(record("b", 30)).await.unwrap();

        let history = store.query_telemetry_history("a", 3).await.unwrap();
        let minutes: Vec<_> = history
            .iter()
            .map(|r| r.timestamp.format("%M").to_string())
            .collect();
        assert_eq!(minutes, vec!["09", "05", "03"]);
    }

    #[tokio::test]
    async fn test_upsert_keeps_latest_seen_and_orders_devices() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.upsert_device("a", now).await.unwrap();
        store.upsert_device("b", now + Duration::seconds(5)).await.unwrap();
        store.upsert_device("a", now - Duration::seconds(60)).await.unwrap();

        let devices = store.list_devices().await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].device_id, "b");
        assert_eq!(devices[1].last_seen, now);
        assert_eq!(devices[1].display_name, "a");
        assert!(devices[1].is_online);
    }

    #[tokio::test]
    async fn test_latest_through_default_method() {
        let store = MemoryStore::new();
        store.append_telemetry(record("a", 5)).await.unwrap();
        store.append_telemetry(record("a", 1)).await.unwrap();
        store.append_telemetry(record("b", 2)).await.unwrap();

        let latest = store.query_latest_telemetry(Some("a")).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].timestamp, record("a", 5).timestamp);

        assert_eq!(store.query_latest_telemetry(None).await.unwrap().len(), 2);
    }
}
