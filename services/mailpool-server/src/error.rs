//! HTTP error responses
//!
//! Every failed request answers with
//! `{"error":{"type","message","request_id"}}` and a status derived from the
//! client error kind.

use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use mail_client::{Error as ClientError, ErrorKind};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("invalid request: {0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Client(ClientError::UsageLimit(_)) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Client(ClientError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Client(e) => match e.kind() {
                ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                ErrorKind::CredentialExhausted => StatusCode::PAYMENT_REQUIRED,
                ErrorKind::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
                ErrorKind::RemoteRejected | ErrorKind::Transient => StatusCode::BAD_GATEWAY,
            },
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "invalid_request",
            ApiError::Client(e) => match e {
                ClientError::Timeout(_) => "timeout",
                ClientError::Network(_) => "network_error",
                ClientError::CredentialExhausted { .. } => "credential_exhausted",
                ClientError::PoolExhausted(_) => "pool_exhausted",
                ClientError::InvalidInput(_) => "invalid_input",
                ClientError::RemoteRejected { .. } => "remote_rejected",
                ClientError::UsageLimit(_) => "usage_limit",
                ClientError::Storage(_) => "storage_error",
                ClientError::Decode(_) => "bad_upstream_response",
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
        let status = self.status();
        warn!(
            request_id = %request_id,
            status = status.as_u16(),
            error_type = self.error_type(),
            error = %self,
            "request failed"
        );
        let body = serde_json::json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
                "request_id": request_id,
            }
        });
        (status, [(CONTENT_TYPE, "application/json")], body.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn status_follows_error_kind() {
        let cases = [
            (ClientError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (ClientError::UsageLimit("x".into()), StatusCode::TOO_MANY_REQUESTS),
            (
                ClientError::CredentialExhausted {
                    status: 401,
                    message: "Invalid API Key".into(),
                },
                StatusCode::PAYMENT_REQUIRED,
            ),
            (
                ClientError::PoolExhausted("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ClientError::RemoteRejected {
                    status: 404,
                    message: "not found".into(),
                },
                StatusCode::BAD_GATEWAY,
            ),
            (
                ClientError::Timeout(Duration::from_secs(30)),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (ClientError::Network("reset".into()), StatusCode::BAD_GATEWAY),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status(), expected);
        }
        assert_eq!(
            ApiError::BadRequest("bad json".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn response_body_carries_type_message_and_request_id() {
        let response = ApiError::from(ClientError::PoolExhausted(
            "all API keys are exhausted".into(),
        ))
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "pool_exhausted");
        assert!(
            json["error"]["message"]
                .as_str()
                .unwrap()
                .contains("all API keys are exhausted")
        );
        assert!(
            json["error"]["request_id"]
                .as_str()
                .unwrap()
                .starts_with("req_")
        );
    }
}
