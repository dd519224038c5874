use crate::archive::ArchivedReading;
use crate::error::Result;
use crate::upsert::UpsertOperation;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

/// Persistence seam for the ingest path.
///
/// `upsert_energy` must overwrite an existing row for the same
/// (device, timestamp) rather than add to it, so redelivered batches are safe.
#[async_trait]
pub trait EnergyStore: Send + Sync {
    async fn upsert_energy(&self, table: &str, ops: &[UpsertOperation]) -> Result<()>;
    async fn archive_readings(&self, table: &str, rows: &[ArchivedReading]) -> Result<()>;
}

pub type EnergyKey = (String, NaiveDateTime);

/// In-process store with the same upsert semantics as the database.
#[derive(Debug, Default)]
pub struct MemoryStore {
    energy: Mutex<BTreeMap<String, BTreeMap<EnergyKey, f64>>>,
    archive: Mutex<BTreeMap<String, Vec<ArchivedReading>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn energy_table(&self, table: &str) -> BTreeMap<EnergyKey, f64> {
        self.energy
            .lock()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn archived(&self, table: &str) -> Vec<ArchivedReading> {
        self.archive
            .lock()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl EnergyStore for MemoryStore {
    async fn upsert_energy(&self, table: &str, ops: &[UpsertOperation]) -> Result<()> {
        let mut tables = self.energy.lock().await;
        let rows = tables.entry(table.to_string()).or_default();
        for op in ops {
            rows.insert((op.device_name.clone(), op.timestamp), op.energy_consumed);
        }
        Ok(())
    }

    async fn archive_readings(&self, table: &str, rows: &[ArchivedReading]) -> Result<()> {
        self.archive
            .lock()
            .await
            .entry(table.to_string())
            .or_default()
            .extend_from_slice(rows);
        Ok(())
    }
}
