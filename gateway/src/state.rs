use crate::errors::Result;
use crate::model::TelemetryRecord;
use crate::store::TelemetryStore;
use std::collections::HashMap;
use std::sync::Arc;

/// Keeps, per device, the record with the greatest timestamp. Input order is
/// irrelevant; equal timestamps are decided by the storage id.
pub fn latest_per_device<I>(records: I) -> Vec<TelemetryRecord>
where
    I: IntoIterator<Item = TelemetryRecord>,
{
    let mut latest: HashMap<String, TelemetryRecord> = HashMap::new();

    for record in records {
        match latest.get(&record.device_id) {
            Some(current) if !is_newer(&record, current) => {}
            _ => {
                latest.insert(record.device_id.clone(), record);
            }
        }
    }

    latest.into_values().collect()
}

fn is_newer(candidate: &TelemetryRecord, current: &TelemetryRecord) -> bool {
    (candidate.timestamp, candidate.id) > (current.timestamp, current.id)
}

/// Answers "current known state" queries from the telemetry log.
#[derive(Clone)]
pub struct StateAggregator {
    store: Arc<dyn TelemetryStore>,
}

impl StateAggregator {
    pub fn new(store: Arc<dyn TelemetryStore>) -> Self {
        Self { store }
    }

    pub async fn latest(&self, device_id: &str) -> Result<Option<TelemetryRecord>> {
        let records = self.store.query_latest_telemetry(Some(device_id)).await?;
        Ok(records.into_iter().find(|r| r.device_id == device_id))
    }

    pub async fn latest_all(&self) -> Result<Vec<TelemetryRecord>> {
        self.store.query_latest_telemetry(None).await
    }
}
