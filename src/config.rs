use crate::aggregate::AggregatorSettings;
use crate::energy::{DEFAULT_POWER_FACTOR, DEFAULT_VOLTAGE};
use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::{fs, path::Path};

pub const MAX_CHANNELS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub database: DbConfig,
    pub pipelines: Vec<Pipeline>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
}

fn default_mqtt_port() -> u16 {
    1883
}
fn default_keep_alive() -> u64 {
    30
}
fn default_clean_session() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    /// MQTT topic filter; `+` and `#` wildcards are allowed.
    pub topic: String,
    #[serde(default = "default_qos")]
    pub qos: u8,
    /// Table receiving one upserted row per (device, bucket end).
    pub table: String,
    /// Optional table receiving every accepted reading as-is.
    #[serde(default)]
    pub raw_table: Option<String>,
    #[serde(default)]
    pub reading: ReadingLayout,
    #[serde(default)]
    pub aggregation: AggregationConfig,
}

fn default_qos() -> u8 {
    1
}

/// Where the interesting values live inside one raw reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingLayout {
    #[serde(default = "default_device_path")]
    pub device_path: String,
    #[serde(default = "default_timestamp_path")]
    pub timestamp_path: String,
    /// JSONPath per channel, in channel order.
    #[serde(default = "default_channel_paths")]
    pub channel_paths: Vec<String>,
    /// Extra columns for archived readings: column name -> JSONPath.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

fn default_device_path() -> String {
    "$.deviceName".into()
}
fn default_timestamp_path() -> String {
    "$.timestamp".into()
}
fn default_channel_paths() -> Vec<String> {
    (1..=MAX_CHANNELS).map(|i| format!("$.channel{}", i)).collect()
}

impl Default for ReadingLayout {
    fn default() -> Self {
        Self {
            device_path: default_device_path(),
            timestamp_path: default_timestamp_path(),
            channel_paths: default_channel_paths(),
            tags: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    #[serde(default = "default_voltage")]
    pub voltage: f64,
    #[serde(default = "default_power_factor", alias = "powerFactor")]
    pub power_factor: f64,
    #[serde(default = "default_bucket_width", alias = "bucketWidthMinutes")]
    pub bucket_width_minutes: u32,
}

fn default_voltage() -> f64 {
    DEFAULT_VOLTAGE
}
fn default_power_factor() -> f64 {
    DEFAULT_POWER_FACTOR
}
fn default_bucket_width() -> u32 {
    30
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            voltage: default_voltage(),
            power_factor: default_power_factor(),
            bucket_width_minutes: default_bucket_width(),
        }
    }
}

impl AggregationConfig {
    /// Checked settings, or `AppError::Config` if any value is unusable.
    pub fn settings(&self) -> Result<AggregatorSettings> {
        AggregatorSettings::try_from(self)
    }
}

impl Config {
    /// Load YAML from disk, substitute $(VAR)/${VAR} with env vars, then parse.
    /// Afterwards `DATABASE_URL` and `MQTT_HOST` override the file, if set.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let expanded = expand_env_placeholders(&raw)?;
        let mut cfg: Self = serde_yaml::from_str(&expanded)?;

        if let Ok(url) = std::env::var("DATABASE_URL") {
            cfg.database.url = url;
        }
        if let Ok(host) = std::env::var("MQTT_HOST") {
            cfg.mqtt.host = host;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipelines.is_empty() {
            return Err(AppError::Config(
                "config must include at least one pipeline".into(),
            ));
        }
        let mut names = BTreeSet::new();
        for p in &self.pipelines {
            if !names.insert(p.name.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate pipeline name '{}'",
                    p.name
                )));
            }
            p.validate()?;
        }
        Ok(())
    }
}

impl Pipeline {
    pub fn validate(&self) -> Result<()> {
        self.aggregation
            .settings()
            .map_err(|e| match e {
                AppError::Config(msg) => {
                    AppError::Config(format!("pipeline '{}': {}", self.name, msg))
                }
                other => other,
            })?;

        let channels = self.reading.channel_paths.len();
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(AppError::Config(format!(
                "pipeline '{}' must map between 1 and {} channels, got {}",
                self.name, MAX_CHANNELS, channels
            )));
        }

        check_identifier(&self.name, &self.table)?;
        if let Some(raw) = &self.raw_table {
            check_identifier(&self.name, raw)?;
            for column in self.reading.tags.keys() {
                check_identifier(&self.name, column)?;
            }
        }
        Ok(())
    }
}

/// Table and column names are spliced into SQL, so only plain identifiers
/// (optionally schema-qualified) are accepted.
fn check_identifier(pipeline: &str, ident: &str) -> Result<()> {
    let valid = !ident.is_empty()
        && ident.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(AppError::Config(format!(
            "pipeline '{}': '{}' is not a valid SQL identifier",
            pipeline, ident
        )))
    }
}

/// Expand $(VAR) and ${VAR} placeholders using environment variables.
/// "$.path" (JSONPath) is left alone and "$$" becomes a literal "$".
fn expand_env_placeholders(input: &str) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut it = input.chars().peekable();

    while let Some(c) = it.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let close = match it.peek().copied() {
            Some('$') => {
                it.next();
                out.push('$');
                continue;
            }
            Some('(') => ')',
            Some('{') => '}',
            _ => {
                out.push('$');
                continue;
            }
        };
        it.next();
        let var = read_until(&mut it, close).ok_or_else(|| {
            AppError::Config(format!("unterminated env placeholder: missing '{}'", close))
        })?;
        let val = std::env::var(&var)
            .map_err(|_| AppError::Config(format!("missing environment variable: {}", var)))?;
        out.push_str(&val);
    }

    Ok(out)
}

/// Consumes up to and including `end`; `None` if it never shows up.
fn read_until<I>(it: &mut std::iter::Peekable<I>, end: char) -> Option<String>
where
    I: Iterator<Item = char>,
{
    let mut buf = String::new();
    for ch in it.by_ref() {
        if ch == end {
            return Some(buf);
        }
        buf.push(ch);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn parse(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    const MINIMAL: &str = r#"
mqtt:
  host: "localhost"
database:
  url: "postgres://localhost/iot"
pipelines:
  - name: "half-hour"
    topic: "iot/+/readings"
    table: "energy_data"
"#;

    #[test]
    fn defaults_fill_missing_sections() {
        let cfg = parse(MINIMAL);
        cfg.validate().unwrap();

        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.mqtt.keep_alive_secs, 30);
        assert_eq!(cfg.database.max_connections, 10);

        let p = &cfg.pipelines[0];
        assert_eq!(p.qos, 1);
        assert!(p.raw_table.is_none());
        assert_eq!(p.reading.device_path, "$.deviceName");
        assert_eq!(
            p.reading.channel_paths,
            vec!["$.channel1", "$.channel2", "$.channel3"]
        );
        assert_eq!(p.aggregation.voltage, 200.0);
        assert_eq!(p.aggregation.power_factor, 1.0);
        assert_eq!(p.aggregation.bucket_width_minutes, 30);
    }

    #[test]
    fn accepts_camel_case_aggregation_keys() {
        let cfg = parse(
            r#"
mqtt: { host: "localhost" }
database: { url: "postgres://localhost/iot" }
pipelines:
  - name: "hourly"
    topic: "iot/#"
    table: "consumption"
    aggregation:
      voltage: 230
      powerFactor: 0.8
      bucketWidthMinutes: 60
"#,
        );
        cfg.validate().unwrap();
        let agg = &cfg.pipelines[0].aggregation;
        assert_eq!(agg.voltage, 230.0);
        assert_eq!(agg.power_factor, 0.8);
        assert_eq!(agg.bucket_width_minutes, 60);
    }

    #[test]
    fn rejects_bad_aggregation_settings() {
        let mut cfg = parse(MINIMAL);
        cfg.pipelines[0].aggregation.voltage = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = parse(MINIMAL);
        cfg.pipelines[0].aggregation.bucket_width_minutes = 45;
        assert!(cfg.validate().is_err());

        let mut cfg = parse(MINIMAL);
        cfg.pipelines[0].aggregation.power_factor = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_structural_problems() {
        let mut cfg = parse(MINIMAL);
        cfg.pipelines.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = parse(MINIMAL);
        let dup = cfg.pipelines[0].clone();
        cfg.pipelines.push(dup);
        assert!(cfg.validate().is_err());

        let mut cfg = parse(MINIMAL);
        cfg.pipelines[0].reading.channel_paths.push("$.channel4".into());
        assert!(cfg.validate().is_err());

        let mut cfg = parse(MINIMAL);
        cfg.pipelines[0].table = "energy; DROP TABLE x".into();
        assert!(cfg.validate().is_err());

        let mut cfg = parse(MINIMAL);
        cfg.pipelines[0].table = "iot.energy_data".into();
        cfg.validate().unwrap();
    }

    #[test]
    #[serial]
    fn expands_placeholders_and_keeps_jsonpath() {
        std::env::set_var("EA_TEST_HOST", "broker.local");
        let out = expand_env_placeholders("host: $(EA_TEST_HOST) ${EA_TEST_HOST} $.a $$").unwrap();
        assert_eq!(out, "host: broker.local broker.local $.a $");
        std::env::remove_var("EA_TEST_HOST");

        assert!(expand_env_placeholders("${EA_TEST_UNSET_VAR}").is_err());
        assert!(expand_env_placeholders("$(EA_TEST_HOST").is_err());
    }

    #[test]
    #[serial]
    fn load_applies_env_overrides() {
        let temp_file =
            std::env::temp_dir().join(format!("ea-config-{}.yaml", std::process::id()));
        std::fs::write(&temp_file, MINIMAL).unwrap();

        let original_db = std::env::var("DATABASE_URL").ok();
        let original_host = std::env::var("MQTT_HOST").ok();
        std::env::set_var("DATABASE_URL", "postgres://override/iot");
        std::env::set_var("MQTT_HOST", "mqtt.override");

        let cfg = Config::load(&temp_file).unwrap();
        assert_eq!(cfg.database.url, "postgres://override/iot");
        assert_eq!(cfg.mqtt.host, "mqtt.override");

        match original_db {
            Some(v) => std::env::set_var("DATABASE_URL", v),
            None => std::env::remove_var("DATABASE_URL"),
        }
        match original_host {
            Some(v) => std::env::set_var("MQTT_HOST", v),
            None => std::env::remove_var("MQTT_HOST"),
        }
        std::fs::remove_file(&temp_file).ok();
    }
}
