use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("sensor read failed: {reason}")]
pub struct SensorReadError {
    pub reason: String,
}

impl SensorReadError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("{stage} connection failed: {reason}")]
    Connection { stage: &'static str, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    SensorRead(#[from] SensorReadError),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl NodeError {
    pub fn connection(stage: &'static str, reason: impl Into<String>) -> Self {
        Self::Connection {
            stage,
            reason: reason.into(),
        }
    }
}
