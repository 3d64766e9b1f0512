use thiserror::Error;

/// All errors produced by the inflight tracking layer.
#[derive(Debug, Error)]
pub enum InflightError {
    #[error("timed out waiting for {remaining} acks")]
    DrainTimeout { remaining: usize },

    #[error("too many unacknowledged publishes (limit {limit})")]
    InflightLimit { limit: usize },

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("error closing connection: {0}")]
    Close(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("config parse error: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, InflightError>;
