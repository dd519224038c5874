use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("MQTT error: {0}")]
    Mqtt(String),
    #[error("DB error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Why a single reading was left out of a batch.
///
/// These never fail the batch; the normalizer counts and logs them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedSample {
    #[error("reading is not a JSON object")]
    NotAnObject,
    #[error("device name missing or empty")]
    MissingDevice,
    #[error("timestamp missing or unparseable: {0}")]
    BadTimestamp(String),
    #[error("no channel holds a finite number")]
    NoUsableChannel,
}
