//! Error types for pool operations

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("slot {index} is out of range (pool has {len} keys)")]
    InvalidIndex { index: usize, len: usize },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("persisted pool state is unreadable: {0}")]
    Corrupt(String),

    #[error("pool storage error: {0}")]
    Storage(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<storage::Error> for Error {
    fn from(e: storage::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
