//! Transport and credential seams for the upstream email API
//!
//! Two traits decouple the request path from its collaborators:
//! - `Transport` sends one HTTP request and returns the buffered response.
//!   `ReqwestTransport` is the production implementation; tests script their own.
//! - `CredentialSource` hands out credentials and receives feedback about
//!   them (successful use, exhaustion). The key pool and the mode router
//!   implement it.
//!
//! Both use `Pin<Box<dyn Future>>` return types for dyn-compatibility.

pub mod http;

pub use http::{
    HttpRequest, HttpResponse, ReqwestTransport, Transport, TransportError, TransportFuture,
};

use common::Secret;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;

/// Classification of an upstream error response.
///
/// Drives whether the gateway rotates credentials:
/// - CredentialExhausted marks the credential and retries on a replacement
/// - Rejected surfaces the error without touching the pool
/// - Transient covers attempts that produced no response (timeout, network)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    Transient,
    CredentialExhausted,
    Rejected,
}

/// Where a credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum CredentialOrigin {
    /// Slot in the shared key pool
    Pool { slot: usize },
    /// The user-supplied personal credential
    Personal,
}

impl CredentialOrigin {
    pub fn label(&self) -> &'static str {
        match self {
            CredentialOrigin::Pool { .. } => "pool",
            CredentialOrigin::Personal => "personal",
        }
    }

    pub fn is_pooled(&self) -> bool {
        matches!(self, CredentialOrigin::Pool { .. })
    }
}

/// A credential ready to be attached to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub secret: Secret<String>,
    pub origin: CredentialOrigin,
}

impl Credential {
    pub fn pooled(slot: usize, secret: impl Into<Secret<String>>) -> Self {
        Self {
            secret: secret.into(),
            origin: CredentialOrigin::Pool { slot },
        }
    }

    pub fn personal(secret: impl Into<Secret<String>>) -> Self {
        Self {
            secret: secret.into(),
            origin: CredentialOrigin::Personal,
        }
    }
}

/// Errors from credential sources.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Nothing can be handed out. The payload is a user-facing explanation.
    #[error("no credential available: {0}")]
    Exhausted(String),

    #[error("credential source error: {0}")]
    Internal(String),
}

/// Boxed future returned by `CredentialSource` methods.
pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Supplier of credentials for outbound requests.
pub trait CredentialSource: Send + Sync {
    /// Identifier for logging (e.g. "pool", "router")
    fn id(&self) -> &str;

    /// Credential the next request should use.
    fn acquire(&self) -> SourceFuture<'_, Result<Credential, SourceError>>;

    /// A request made with `origin` succeeded against the monitored host.
    fn record_success(&self, origin: CredentialOrigin) -> SourceFuture<'_, ()>;

    /// The credential at `origin` was rejected for quota or validity reasons.
    ///
    /// Returns the replacement to retry with, or `None` when nothing is left.
    fn report_exhausted(&self, origin: CredentialOrigin) -> SourceFuture<'_, Option<Credential>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_serializes_with_source_tag() {
        let pooled = serde_json::to_value(CredentialOrigin::Pool { slot: 2 }).unwrap();
        assert_eq!(pooled, serde_json::json!({"source": "pool", "slot": 2}));

        let personal = serde_json::to_value(CredentialOrigin::Personal).unwrap();
        assert_eq!(personal, serde_json::json!({"source": "personal"}));
    }

    #[test]
    fn credential_debug_never_shows_secret() {
        let credential = Credential::pooled(0, "very-secret-pool-key");
        let debug = format!("{credential:?}");
        assert!(!debug.contains("very-secret-pool-key"), "got: {debug}");
        assert!(debug.contains("Pool"));
    }

    #[test]
    fn origin_labels() {
        assert_eq!(CredentialOrigin::Pool { slot: 0 }.label(), "pool");
        assert_eq!(CredentialOrigin::Personal.label(), "personal");
        assert!(CredentialOrigin::Pool { slot: 0 }.is_pooled());
        assert!(!CredentialOrigin::Personal.is_pooled());
    }
}
