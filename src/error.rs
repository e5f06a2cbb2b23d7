use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("MQTT error: {0}")]
    Mqtt(String),
    #[error("TLS material error: {0}")]
    Tls(String),
    #[error("Sensor error: {0}")]
    Sensor(String),
    #[error("Time sync error: {0}")]
    Time(String),
    #[error("Network link error: {0}")]
    Link(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;
