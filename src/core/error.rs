use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Duplicate key '{0}'")]
    DuplicateKey(String),

    #[error("Lock service error: {0}")]
    LockService(String),

    #[error("Leader lease lost: {0}")]
    LeaseLost(String),

    #[error("Worker pool construction failed: {0}")]
    PoolConstruction(String),

    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl FeedError {
    /// Returns true for failures that are expected to clear up on a later cycle.
    ///
    /// Configuration and serialization problems will not fix themselves, so they
    /// are reported as permanent.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Config(_) | Self::Serialization(_))
    }
}

pub type Result<T> = std::result::Result<T, FeedError>;

impl From<std::io::Error> for FeedError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
