//! Error types for durable storage

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("storage file is not a JSON object of strings: {0}")]
    Parse(String),
}

/// Result alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;
