//! In-process transport for tests

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use key_pool::{EventSink, KeyPool, ManualClock, MemoryRepository, PoolPolicy};
use reqwest::{Method, StatusCode};
use transport::{HttpRequest, HttpResponse, Transport, TransportError, TransportFuture};

pub const START: u64 = 1_700_000_000_000;
pub const BASE_URL: &str = "https://api.mailslurp.com";

/// One request as the transport saw it.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub credential: Option<String>,
    pub body: Option<String>,
}

type Responder = dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync;

/// Answers each request from a closure and records every attempt.
pub struct ScriptedTransport {
    responder: Box<Responder>,
    attempts: Mutex<Vec<Attempt>>,
}

impl ScriptedTransport {
    pub fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            responder: Box::new(responder),
            attempts: Mutex::new(Vec::new()),
        })
    }

    /// Replays `responses` in order, then answers 500.
    pub fn queue(responses: Vec<Result<HttpResponse, TransportError>>) -> Arc<Self> {
        let queue = Mutex::new(VecDeque::from(responses));
        Self::new(move |_| {
            queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(json(500, r#"{"message":"script exhausted"}"#)))
        })
    }

    pub fn attempts(&self) -> Vec<Attempt> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn credentials(&self) -> Vec<String> {
        self.attempts()
            .into_iter()
            .map(|a| a.credential.unwrap_or_default())
            .collect()
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, request: HttpRequest) -> TransportFuture<'_> {
        self.attempts.lock().unwrap().push(Attempt {
            method: request.method.clone(),
            path: request.url.path().to_string(),
            query: request.url.query().map(str::to_string),
            credential: request
                .headers
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            body: request
                .body
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned()),
        });
        let result = (self.responder)(&request);
        Box::pin(async move { result })
    }
}

pub fn json(status: u16, body: &str) -> HttpResponse {
    let mut response = HttpResponse::new(
        StatusCode::from_u16(status).unwrap(),
        body.as_bytes().to_vec(),
    );
    response.headers.insert(
        reqwest::header::CONTENT_TYPE,
        "application/json".parse().unwrap(),
    );
    response
}

pub fn pool_secret(slot: usize) -> String {
    format!("pool-secret-{slot}-abcdefghijklmnopqrstuvwx")
}

pub async fn test_pool(n: usize, policy: PoolPolicy) -> (Arc<KeyPool>, Arc<ManualClock>, EventSink) {
    let clock = Arc::new(ManualClock::new(START));
    let events = EventSink::new(256);
    let pool = KeyPool::load(
        (0..n).map(pool_secret).collect(),
        policy,
        Arc::new(MemoryRepository::new()),
        events.clone(),
        clock.clone(),
    )
    .await;
    (Arc::new(pool), clock, events)
}
