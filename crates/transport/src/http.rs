//! Buffered HTTP request/response types and the reqwest-backed transport

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use tracing::debug;

/// Default per-attempt timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A fully buffered outbound request.
///
/// Cloneable so the gateway can reissue the exact same request with a
/// different credential.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("application/json"),
        );
        Self {
            method,
            url,
            headers,
            body: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: Url) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn delete(url: Url) -> Self {
        Self::new(Method::DELETE, url)
    }

    /// Attach a JSON body and the matching content type.
    pub fn json(mut self, value: &serde_json::Value) -> Self {
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(Bytes::from(value.to_string()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }
}

/// A fully buffered upstream response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Body as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }
}

/// Failure to obtain any response.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),
}

/// Boxed future returned by `Transport::send`.
pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<HttpResponse, TransportError>> + Send + 'a>>;

/// Sends a single HTTP request. Implementations must not retry.
pub trait Transport: Send + Sync {
    fn send(&self, request: HttpRequest) -> TransportFuture<'_>;
}

/// Transport over a shared `reqwest::Client`.
#[derive(Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Transport for ReqwestTransport {
    fn send(&self, request: HttpRequest) -> TransportFuture<'_> {
        Box::pin(async move {
            let timeout = request.timeout;
            let mut builder = self
                .client
                .request(request.method, request.url)
                .headers(request.headers)
                .timeout(timeout);
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = builder.send().await.map_err(|e| map_error(e, timeout))?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await.map_err(|e| map_error(e, timeout))?;
            debug!(status = status.as_u16(), bytes = body.len(), "upstream response");

            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        })
    }
}

fn map_error(error: reqwest::Error, timeout: Duration) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(timeout)
    } else {
        TransportError::Network(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP/1.1 response per connection.
    async fn canned_server(response: &'static str) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        Url::parse(&format!("http://{addr}/inboxes")).unwrap()
    }

    #[tokio::test]
    async fn buffers_status_headers_and_body() {
        let url = canned_server(
            "HTTP/1.1 402 Payment Required\r\ncontent-type: application/json\r\ncontent-length: 27\r\nconnection: close\r\n\r\n{\"message\":\"Invalid key\"}\r\n",
        )
        .await;

        let transport = ReqwestTransport::default();
        let response = transport.send(HttpRequest::get(url)).await.unwrap();

        assert_eq!(response.status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(response.content_type(), Some("application/json"));
        assert!(response.text().contains("Invalid key"));
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let url = Url::parse(&format!("http://{addr}/inboxes")).unwrap();
        let request = HttpRequest::get(url).with_timeout(Duration::from_millis(200));
        let err = ReqwestTransport::default().send(request).await.unwrap_err();
        assert_eq!(err, TransportError::Timeout(Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn refused_connection_is_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = Url::parse(&format!("http://{addr}/inboxes")).unwrap();
        let err = ReqwestTransport::default()
            .send(HttpRequest::get(url))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Network(_)), "got: {err:?}");
    }

    #[test]
    fn json_sets_body_and_content_type() {
        let url = Url::parse("https://api.mailslurp.com/inboxes").unwrap();
        let request = HttpRequest::post(url).json(&serde_json::json!({"name": "x"}));
        assert_eq!(
            request.headers.get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(request.body.as_deref(), Some(&b"{\"name\":\"x\"}"[..]));
        assert_eq!(request.host(), Some("api.mailslurp.com"));
        assert_eq!(request.timeout, DEFAULT_TIMEOUT);
    }
}
