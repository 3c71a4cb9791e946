use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Unknown command type '{0}'")]
    UnknownCommandType(String),

    #[error("Unable to decode command: {0}")]
    Decode(String),

    #[error("Handler execution failed: {0}")]
    HandlerExecution(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Record of {size} bytes exceeds collection capacity of {max} bytes")]
    RecordTooLarge { size: usize, max: usize },

    #[error("Queue worker failed: {0}")]
    Worker(String),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

impl QueueError {
    /// Whether the error means the backing store could not be reached.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::IoError(_))
    }
}

impl<T> From<std::sync::PoisonError<T>> for QueueError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}
