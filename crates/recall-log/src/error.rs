//! Error types for recall-log.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input error
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Durable write failed; the exchange was not recorded.
    #[error("Write failure: {0}")]
    Write(String),

    /// IO error on the read path
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
