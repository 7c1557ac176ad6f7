//! Credential-aware request execution
//!
//! The gateway wraps a `Transport`: it attaches the credential from its
//! `CredentialSource`, bounds each attempt with a timeout, reports usage on
//! success and, when an error body names a quota or invalid-key problem,
//! rotates once and reissues the identical request.
//!
//! At most two attempts per call. The retried attempt's outcome is final.
//! A `RotationBudget` shared across calls caps a whole logical operation,
//! retries included, at one rotation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use key_pool::ExhaustionClassifier;
use reqwest::header::{HeaderName, HeaderValue};
use transport::{
    Credential, CredentialOrigin, CredentialSource, ErrorClassification, HttpRequest,
    HttpResponse, Transport,
};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// A successful response and the credential that earned it.
#[derive(Debug)]
pub struct Served {
    pub response: HttpResponse,
    pub origin: CredentialOrigin,
}

/// One rotation, shared by every attempt of a logical operation.
#[derive(Debug, Default)]
pub struct RotationBudget {
    spent: AtomicBool,
}

impl RotationBudget {
    /// Claim the rotation. False once it has been used.
    fn take(&self) -> bool {
        !self.spent.swap(true, Ordering::AcqRel)
    }

    pub fn is_spent(&self) -> bool {
        self.spent.load(Ordering::Acquire)
    }
}

pub struct RequestGateway {
    transport: Arc<dyn Transport>,
    source: Arc<dyn CredentialSource>,
    classifier: ExhaustionClassifier,
    header: HeaderName,
    monitored_host: String,
}

impl RequestGateway {
    pub fn new(
        transport: Arc<dyn Transport>,
        source: Arc<dyn CredentialSource>,
        classifier: ExhaustionClassifier,
        header: HeaderName,
        monitored_host: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            source,
            classifier,
            header,
            monitored_host: monitored_host.into(),
        }
    }

    pub fn classifier(&self) -> &ExhaustionClassifier {
        &self.classifier
    }

    pub fn source(&self) -> &Arc<dyn CredentialSource> {
        &self.source
    }

    fn is_monitored(&self, request: &HttpRequest) -> bool {
        request
            .host()
            .is_some_and(|host| host.eq_ignore_ascii_case(&self.monitored_host))
    }

    /// Execute with the source's current credential, rotating at most once.
    pub async fn execute(&self, request: HttpRequest) -> Result<Served> {
        self.execute_within(request, &RotationBudget::default()).await
    }

    /// Like `execute`, but only rotates if `budget` has not been spent by an
    /// earlier call. Otherwise an exhausted credential ends the operation
    /// without touching the source.
    pub async fn execute_within(&self, request: HttpRequest, budget: &RotationBudget) -> Result<Served> {
        let credential = self.source.acquire().await?;
        let monitored = self.is_monitored(&request);

        let response = self.attempt(&request, &credential).await?;
        if response.is_success() {
            metrics::counter!("gateway_attempts_total", "outcome" => "success").increment(1);
            if monitored {
                self.source.record_success(credential.origin).await;
            }
            return Ok(Served {
                response,
                origin: credential.origin,
            });
        }

        let status = response.status.as_u16();
        let body = response.text();
        let message = error_message(&response);
        if !monitored
            || self.classifier.classify(status, &body) != ErrorClassification::CredentialExhausted
        {
            metrics::counter!("gateway_attempts_total", "outcome" => "rejected").increment(1);
            debug!(status, message = %message, "upstream rejected request");
            return Err(Error::RemoteRejected { status, message });
        }

        metrics::counter!("gateway_attempts_total", "outcome" => "exhausted").increment(1);
        warn!(
            status,
            source = credential.origin.label(),
            key = %credential.secret.masked(),
            message = %message,
            "credential rejected by upstream"
        );
        if !budget.take() {
            debug!("rotation already used by this operation");
            return Err(Error::CredentialExhausted { status, message });
        }
        let Some(replacement) = self.source.report_exhausted(credential.origin).await else {
            return Err(Error::CredentialExhausted { status, message });
        };

        metrics::counter!("gateway_rotations_total").increment(1);
        info!(
            source = replacement.origin.label(),
            key = %replacement.secret.masked(),
            "retrying with replacement credential"
        );
        let retried = self.attempt(&request, &replacement).await?;
        if retried.is_success() {
            metrics::counter!("gateway_attempts_total", "outcome" => "success").increment(1);
            self.source.record_success(replacement.origin).await;
            return Ok(Served {
                response: retried,
                origin: replacement.origin,
            });
        }

        let status = retried.status.as_u16();
        let message = error_message(&retried);
        match self.classifier.classify(status, &retried.text()) {
            ErrorClassification::CredentialExhausted => {
                metrics::counter!("gateway_attempts_total", "outcome" => "exhausted").increment(1);
                Err(Error::CredentialExhausted { status, message })
            }
            _ => {
                metrics::counter!("gateway_attempts_total", "outcome" => "rejected").increment(1);
                Err(Error::RemoteRejected { status, message })
            }
        }
    }

    /// One attempt with an explicit credential: no rotation, no usage
    /// accounting. Used to probe individual pool keys.
    pub async fn send_with(&self, request: HttpRequest, credential: &Credential) -> Result<HttpResponse> {
        self.attempt(&request, credential).await
    }

    async fn attempt(&self, request: &HttpRequest, credential: &Credential) -> Result<HttpResponse> {
        let mut request = request.clone();
        let mut value = HeaderValue::from_str(credential.secret.expose())
            .map_err(|_| Error::InvalidInput("credential is not a valid header value".into()))?;
        value.set_sensitive(true);
        request.headers.insert(self.header.clone(), value);

        let timeout = request.timeout;
        debug!(
            method = %request.method,
            path = request.url.path(),
            source = credential.origin.label(),
            "upstream attempt"
        );
        match tokio::time::timeout(timeout, self.transport.send(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                metrics::counter!("gateway_attempts_total", "outcome" => "error").increment(1);
                Err(e.into())
            }
            Err(_) => {
                metrics::counter!("gateway_attempts_total", "outcome" => "error").increment(1);
                Err(Error::Timeout(timeout))
            }
        }
    }
}

/// Human-readable message from an upstream error response.
///
/// Prefers a JSON `message` (or `error`) field, then the raw body, then the
/// status reason.
pub(crate) fn error_message(response: &HttpResponse) -> String {
    if let Ok(value) = response.json::<serde_json::Value>() {
        if let Some(text) = value.as_str() {
            return text.to_string();
        }
        for field in ["message", "error"] {
            if let Some(text) = value.get(field).and_then(|v| v.as_str()) {
                return text.to_string();
            }
        }
    }
    let text = response.text();
    let text = text.trim();
    if text.is_empty() {
        response
            .status
            .canonical_reason()
            .unwrap_or("upstream error")
            .to_string()
    } else {
        text.to_string()
    }
}
