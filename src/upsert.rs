use crate::aggregate::ConsolidatedRecord;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Insert-or-overwrite of one bucket's energy, keyed by
/// (`device_name`, `timestamp`). Applying the same operation twice leaves the
/// store exactly as applying it once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertOperation {
    pub device_name: String,
    #[serde(with = "second_precision")]
    pub timestamp: NaiveDateTime,
    pub energy_consumed: f64,
}

impl UpsertOperation {
    pub fn formatted_timestamp(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }
}

impl From<&ConsolidatedRecord> for UpsertOperation {
    fn from(record: &ConsolidatedRecord) -> Self {
        Self {
            device_name: record.device_name.clone(),
            timestamp: record.bucket_end.naive_utc(),
            energy_consumed: record.energy_kwh,
        }
    }
}

pub fn to_upserts(records: &[ConsolidatedRecord]) -> Vec<UpsertOperation> {
    records.iter().map(UpsertOperation::from).collect()
}

mod second_precision {
    use super::TIMESTAMP_FORMAT;
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&ts.format(TIMESTAMP_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT).map_err(serde::de::Error::custom)
    }
}
