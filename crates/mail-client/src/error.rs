//! Client error taxonomy
//!
//! Every failure surfaced to callers maps onto one `ErrorKind`, which
//! decides whether the generic retry helper may repeat the operation.

use std::time::Duration;

use transport::{SourceError, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network failure or timeout; retried with backoff
    Transient,
    /// Quota/invalid-key rejection with no replacement credential
    CredentialExhausted,
    /// No credential available anywhere
    PoolExhausted,
    /// Bad parameters; never retried
    InvalidInput,
    /// Upstream error unrelated to credentials
    RemoteRejected,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("credential rejected (HTTP {status}): {message}")]
    CredentialExhausted { status: u16, message: String },

    #[error("no API key available: {0}")]
    PoolExhausted(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("upstream rejected the request (HTTP {status}): {message}")]
    RemoteRejected { status: u16, message: String },

    #[error("usage limit reached: {0}")]
    UsageLimit(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("unexpected upstream response: {0}")]
    Decode(String),
}

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Timeout(_) | Error::Network(_) | Error::Storage(_) => ErrorKind::Transient,
            Error::CredentialExhausted { .. } => ErrorKind::CredentialExhausted,
            Error::PoolExhausted(_) => ErrorKind::PoolExhausted,
            Error::InvalidInput(_) | Error::UsageLimit(_) => ErrorKind::InvalidInput,
            Error::RemoteRejected { .. } | Error::Decode(_) => ErrorKind::RemoteRejected,
        }
    }

    /// Whether the generic backoff helper may repeat the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transient | ErrorKind::RemoteRejected
        )
    }

    /// Upstream message text, if the error came from a response.
    pub fn upstream_message(&self) -> Option<&str> {
        match self {
            Error::CredentialExhausted { message, .. } | Error::RemoteRejected { message, .. } => {
                Some(message)
            }
            _ => None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout(after) => Error::Timeout(after),
            TransportError::Network(msg) => Error::Network(msg),
        }
    }
}

impl From<SourceError> for Error {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::Exhausted(msg) => Error::PoolExhausted(msg),
            SourceError::Internal(msg) => Error::Storage(msg),
        }
    }
}

impl From<key_pool::Error> for Error {
    fn from(e: key_pool::Error) -> Self {
        match e {
            key_pool::Error::InvalidIndex { .. } | key_pool::Error::InvalidKey(_) => {
                Error::InvalidInput(e.to_string())
            }
            key_pool::Error::PoolExhausted(msg) => Error::PoolExhausted(msg),
            key_pool::Error::Corrupt(msg) | key_pool::Error::Storage(msg) => Error::Storage(msg),
        }
    }
}

impl From<storage::Error> for Error {
    fn from(e: storage::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
