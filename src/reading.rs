//! Turns loosely shaped gateway payloads into typed samples.
//!
//! All coercion of untrusted input happens here. A reading that cannot be
//! used is dropped and counted; it never fails the rest of its batch.

use crate::config::ReadingLayout;
use crate::error::{AppError, MalformedSample};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use jsonpath_lib as jsonpath;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// One current measurement. Channels that were missing or unparseable carry
/// a value of 0 so that positions stay stable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelReading {
    pub value: f64,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub device_name: String,
    pub ts: DateTime<Utc>,
    pub channels: Vec<ChannelReading>,
}

impl Sample {
    pub fn total_current(&self) -> f64 {
        self.channels.iter().map(|c| c.value).sum()
    }
}

/// Splits a payload into individual reading records: a JSON array yields its
/// elements, anything else is a batch of one.
pub fn decode_batch(payload: &[u8]) -> Result<Vec<Value>, AppError> {
    let json: Value = serde_json::from_slice(payload)?;
    Ok(match json {
        Value::Array(items) => items,
        other => vec![other],
    })
}

/// Normalizes readings one at a time while counting the ones it rejects.
pub struct Normalizer<'a> {
    layout: &'a ReadingLayout,
    dropped: usize,
}

impl<'a> Normalizer<'a> {
    pub fn new(layout: &'a ReadingLayout) -> Self {
        Self { layout, dropped: 0 }
    }

    pub fn normalize(&mut self, raw: &Value) -> Option<Sample> {
        match try_normalize(self.layout, raw) {
            Ok(sample) => Some(sample),
            Err(reason) => {
                self.dropped += 1;
                debug!(reason = %reason, "dropping malformed reading");
                None
            }
        }
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub samples: Vec<Sample>,
    pub dropped: usize,
}

pub fn normalize_batch(layout: &ReadingLayout, records: &[Value]) -> NormalizedBatch {
    let mut normalizer = Normalizer::new(layout);
    let samples = records
        .iter()
        .filter_map(|r| normalizer.normalize(r))
        .collect();
    NormalizedBatch {
        samples,
        dropped: normalizer.dropped(),
    }
}

/// A sample needs a device name, a parseable timestamp and at least one
/// channel holding a finite number. Other channels fall back to 0.
pub fn try_normalize(layout: &ReadingLayout, raw: &Value) -> Result<Sample, MalformedSample> {
    if !raw.is_object() {
        return Err(MalformedSample::NotAnObject);
    }

    let device_name = match first_jsonpath(&layout.device_path, raw) {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(MalformedSample::MissingDevice),
    };

    let ts_value = first_jsonpath(&layout.timestamp_path, raw)
        .ok_or_else(|| MalformedSample::BadTimestamp("missing".into()))?;
    let ts = parse_timestamp(&ts_value).map_err(MalformedSample::BadTimestamp)?;

    let mut usable = 0;
    let channels = layout
        .channel_paths
        .iter()
        .map(|path| {
            let (value, unit) = match first_jsonpath(path, raw) {
                Some(v) => coerce_channel(&v),
                None => (None, None),
            };
            if value.is_some() {
                usable += 1;
            }
            ChannelReading {
                value: value.unwrap_or(0.0),
                unit,
            }
        })
        .collect();

    if usable == 0 {
        return Err(MalformedSample::NoUsableChannel);
    }

    Ok(Sample {
        device_name,
        ts,
        channels,
    })
}

/// Accepts `12.5`, `"12.5"` or `{"value": 12.5, "unit": "A"}`.
fn coerce_channel(v: &Value) -> (Option<f64>, Option<String>) {
    match v {
        Value::Object(obj) => {
            let value = obj.get("value").and_then(coerce_number);
            let unit = obj
                .get("unit")
                .and_then(Value::as_str)
                .filter(|u| !u.is_empty())
                .map(str::to_string);
            (value, unit)
        }
        other => (coerce_number(other), None),
    }
}

fn coerce_number(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

/// RFC 3339 strings keep their offset; naive strings are read as UTC;
/// integers are Unix epoch milliseconds.
pub fn parse_timestamp(v: &Value) -> Result<DateTime<Utc>, String> {
    match v {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
                .ok_or_else(|| format!("unrecognised timestamp '{}'", s))
        }
        Value::Number(n) => {
            let ms = n
                .as_i64()
                .ok_or_else(|| format!("epoch millis not an integer: {}", n))?;
            Utc.timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| format!("epoch millis out of range: {}", ms))
        }
        other => Err(format!("unsupported timestamp value: {}", other)),
    }
}

pub(crate) fn first_jsonpath(path: &str, json: &Value) -> Option<Value> {
    jsonpath::select(json, path)
        .ok()
        .and_then(|v| v.into_iter().next().cloned())
        .filter(|v| !v.is_null())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn layout() -> ReadingLayout {
        ReadingLayout::default()
    }

    #[test]
    fn accepts_gateway_object_channels() {
        let raw = json!({
            "deviceName": "CT-01",
            "timestamp": "2024-01-01T10:15:00Z",
            "channel1": {"value": 10.5, "unit": "A"},
            "channel2": {"value": "2.5", "unit": "A"},
            "channel3": {"value": 0}
        });

        let sample = try_normalize(&layout(), &raw).unwrap();
        assert_eq!(sample.device_name, "CT-01");
        assert_eq!(sample.ts.to_rfc3339(), "2024-01-01T10:15:00+00:00");
        assert_eq!(
            sample.channels,
            vec![
                ChannelReading { value: 10.5, unit: Some("A".into()) },
                ChannelReading { value: 2.5, unit: Some("A".into()) },
                ChannelReading { value: 0.0, unit: None },
            ]
        );
        assert_eq!(sample.total_current(), 13.0);
    }

    #[test]
    fn accepts_bare_numbers_and_strings() {
        let raw = json!({
            "deviceName": "CT-02",
            "timestamp": "2024-01-01 10:15:00",
            "channel1": 4,
            "channel2": " 1.25 ",
            "channel3": "3"
        });
        let sample = try_normalize(&layout(), &raw).unwrap();
        let values: Vec<f64> = sample.channels.iter().map(|c| c.value).collect();
        assert_eq!(values, vec![4.0, 1.25, 3.0]);
    }

    #[test]
    fn missing_or_bad_channels_count_as_zero() {
        let raw = json!({
            "deviceName": "CT-03",
            "timestamp": "2024-01-01T10:15:00",
            "channel1": "n/a",
            "channel2": 7.0
        });
        let sample = try_normalize(&layout(), &raw).unwrap();
        let values: Vec<f64> = sample.channels.iter().map(|c| c.value).collect();
        assert_eq!(values, vec![0.0, 7.0, 0.0]);
    }

    #[test]
    fn drops_reading_without_any_usable_channel() {
        let raw = json!({
            "deviceName": "CT-04",
            "timestamp": "2024-01-01T10:15:00",
            "channel1": "abc",
            "channel2": {"unit": "A"},
            "channel3": null
        });
        assert_eq!(
            try_normalize(&layout(), &raw),
            Err(MalformedSample::NoUsableChannel)
        );
    }

    #[test]
    fn drops_bad_timestamp_and_missing_device() {
        let raw = json!({"deviceName": "CT-05", "timestamp": "yesterday", "channel1": 1});
        assert!(matches!(
            try_normalize(&layout(), &raw),
            Err(MalformedSample::BadTimestamp(_))
        ));

        let raw = json!({"deviceName": "CT-05", "channel1": 1});
        assert!(matches!(
            try_normalize(&layout(), &raw),
            Err(MalformedSample::BadTimestamp(_))
        ));

        let raw = json!({"deviceName": "  ", "timestamp": "2024-01-01T10:15:00", "channel1": 1});
        assert_eq!(
            try_normalize(&layout(), &raw),
            Err(MalformedSample::MissingDevice)
        );

        assert_eq!(
            try_normalize(&layout(), &json!(42)),
            Err(MalformedSample::NotAnObject)
        );
    }

    #[test]
    fn timestamp_formats() {
        let with_offset = parse_timestamp(&json!("2024-01-01T12:15:00+02:00")).unwrap();
        assert_eq!(with_offset.to_rfc3339(), "2024-01-01T10:15:00+00:00");

        let fractional = parse_timestamp(&json!("2024-01-01T10:15:00.250")).unwrap();
        assert_eq!(fractional.timestamp_subsec_millis(), 250);

        let millis = parse_timestamp(&json!(1704104100000_i64)).unwrap();
        assert_eq!(millis.to_rfc3339(), "2024-01-01T10:15:00+00:00");

        assert!(parse_timestamp(&json!(true)).is_err());
        assert!(parse_timestamp(&json!(1.5)).is_err());
    }

    #[test]
    fn custom_layout_paths() {
        let layout = ReadingLayout {
            device_path: "$.meta.device".into(),
            timestamp_path: "$.meta.at".into(),
            channel_paths: vec!["$.phases[0]".into(), "$.phases[1]".into()],
            ..ReadingLayout::default()
        };
        let raw = json!({
            "meta": {"device": "board-7", "at": "2024-03-05T08:00:00Z"},
            "phases": [1.5, 2.5]
        });
        let sample = try_normalize(&layout, &raw).unwrap();
        assert_eq!(sample.device_name, "board-7");
        assert_eq!(sample.channels.len(), 2);
        assert_eq!(sample.total_current(), 4.0);
    }

    #[test]
    fn batch_decoding_and_drop_count() {
        let single = decode_batch(br#"{"deviceName":"a"}"#).unwrap();
        assert_eq!(single.len(), 1);

        let payload = json!([
            {"deviceName": "a", "timestamp": "2024-01-01T10:15:00", "channel1": 1},
            {"deviceName": "b", "timestamp": "garbage", "channel1": 1},
            {"deviceName": "c", "timestamp": "2024-01-01T10:20:00", "channel1": "x"},
            {"deviceName": "d", "timestamp": "2024-01-01T10:25:00", "channel3": 2}
        ])
        .to_string();
        let records = decode_batch(payload.as_bytes()).unwrap();
        assert_eq!(records.len(), 4);

        let batch = normalize_batch(&layout(), &records);
        assert_eq!(batch.dropped, 2);
        let devices: Vec<&str> = batch.samples.iter().map(|s| s.device_name.as_str()).collect();
        assert_eq!(devices, vec!["a", "d"]);

        assert!(decode_batch(b"not json").is_err());
    }
}
