use thiserror::Error;

/// All errors produced by the sequence-ordering layer.
#[derive(Debug, Error)]
pub enum SeqOrderError {
    #[error("given sequence id is lower than the current sequence, current: {cursor}, given: {seq}")]
    StaleSequence { seq: u64, cursor: u64 },

    #[error("sequence buffer is already being consumed")]
    AlreadyConsuming,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("config parse error: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SeqOrderError>;
