use crate::reading::{first_jsonpath, ChannelReading, Sample};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

/// A single accepted reading as stored in a pipeline's `raw_table`.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedReading {
    pub ts: DateTime<Utc>,
    pub device_name: String,
    pub channels: Vec<ChannelReading>,
    pub tags: BTreeMap<String, String>,
}

impl ArchivedReading {
    /// `tags` maps column names to JSONPaths looked up in the raw record;
    /// paths that match nothing are left out.
    pub fn from_sample(sample: &Sample, raw: &Value, tags: &BTreeMap<String, String>) -> Self {
        let tags = tags
            .iter()
            .filter_map(|(col, path)| {
                first_jsonpath(path, raw).map(|v| (col.clone(), stringify_json(&v)))
            })
            .collect();
        Self {
            ts: sample.ts,
            device_name: sample.device_name.clone(),
            channels: sample.channels.clone(),
            tags,
        }
    }
}

fn stringify_json(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
