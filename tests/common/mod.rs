//! Shared test plumbing: an in-memory transport with a scripted responder
//! and a request log.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use haystack_client::{
    HttpRequest, HttpResponse, HttpTransport, RetryPolicy, Session, TransportError,
};

type Responder = Box<dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync>;

/// An [`HttpTransport`] that answers from a closure and records every
/// request it sees.
pub struct FakeTransport {
    responder: Responder,
    delay: Option<Duration>,
    log: Mutex<Vec<HttpRequest>>,
}

impl FakeTransport {
    pub fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            responder: Box::new(responder),
            delay: None,
            log: Mutex::new(Vec::new()),
        })
    }

    /// Like [`FakeTransport::new`], but every roundtrip takes at least
    /// `delay`, leaving a window for concurrent requests to overlap.
    pub fn with_delay<F>(delay: Duration, responder: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            responder: Box::new(responder),
            delay: Some(delay),
            log: Mutex::new(Vec::new()),
        })
    }

    pub fn request_count(&self) -> usize {
        self.log.lock().len()
    }

    /// Requests whose URI ends with the given path.
    pub fn requests_to(&self, path: &str) -> Vec<HttpRequest> {
        self.log
            .lock()
            .iter()
            .filter(|req| {
                req.uri
                    .split('?')
                    .next()
                    .is_some_and(|uri| uri.ends_with(path))
            })
            .cloned()
            .collect()
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.log.lock().clone()
    }

    pub fn last_request(&self) -> HttpRequest {
        self.log.lock().last().cloned().expect("no request made")
    }
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn roundtrip(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.log.lock().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.responder)(&request)
    }
}

/// A session against `http://test.local/` with the fake transport, the
/// standard `haystack` API directory and a fast retry schedule.
pub fn session_with(transport: Arc<FakeTransport>) -> Session {
    Session::builder("http://test.local/")
        .api_dir("haystack")
        .retry_policy(fast_retries())
        .transport(transport)
        .build()
        .expect("session config")
}

pub fn fast_retries() -> RetryPolicy {
    RetryPolicy {
        initial_backoff: Duration::from_millis(1),
        backoff_multiplier: 1.0,
        max_backoff: Duration::from_millis(1),
    }
}

pub fn response(status: u16, content_type: &str, body: &str) -> HttpResponse {
    HttpResponse {
        status,
        headers: vec![("content-type".to_string(), content_type.to_string())],
        cookies: Vec::new(),
        body: body.as_bytes().to_vec(),
    }
}

pub fn text_response(body: &str) -> HttpResponse {
    response(200, "text/plain", body)
}

pub fn grid_response(grid: Value) -> HttpResponse {
    response(200, "application/json", &grid.to_string())
}

/// A two-site read response.
pub fn sites_grid() -> Value {
    json!({
        "meta": {"ver": "3.0"},
        "cols": [{"name": "id"}, {"name": "site"}, {"name": "area"}],
        "rows": [
            {"id": "r:site1 Head Office", "site": "m:", "area": 2000},
            {"id": "r:site2 Warehouse", "site": "m:", "area": "n:1500 m²"}
        ]
    })
}

pub fn empty_grid() -> Value {
    json!({
        "meta": {"ver": "3.0"},
        "cols": [{"name": "empty"}],
        "rows": []
    })
}

pub fn err_grid(dis: &str) -> Value {
    json!({
        "meta": {"ver": "3.0", "err": "m:", "dis": dis, "errTrace": "line 1"},
        "cols": [{"name": "empty"}],
        "rows": []
    })
}

pub fn connection_refused() -> TransportError {
    TransportError::Connection {
        message: "connection refused".to_string(),
    }
}

/// The decoded JSON body of a request, for inspecting POSTed grids.
pub fn body_json(request: &HttpRequest) -> Value {
    let body = request.body.as_deref().expect("request has no body");
    serde_json::from_slice(body).expect("request body is not JSON")
}

pub fn param<'a>(request: &'a HttpRequest, name: &str) -> Option<&'a str> {
    request
        .params
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

pub fn header<'a>(request: &'a HttpRequest, name: &str) -> Option<&'a str> {
    request
        .headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

pub fn cookie<'a>(request: &'a HttpRequest, name: &str) -> Option<&'a str> {
    request
        .cookies
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}
