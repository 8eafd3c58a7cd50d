use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PhysicalError {
    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("write conflict: {0}")]
    WriteConflict(String),

    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl PhysicalError {
    /// Only serialization conflicts inside a batch are worth another attempt.
    /// Everything else is surfaced to the caller as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PhysicalError::TransactionAborted(_))
    }
}
