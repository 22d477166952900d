//! Transport seam between the client core and the real HTTP layer.
//!
//! The core never talks HTTP directly; it hands a [`Request`] to a
//! [`Transport`] and receives either a [`RawResponse`] or a
//! [`RawFailure`]. A [`ScriptedTransport`] replays canned outcomes for
//! tests and smoke runs.

use std::{
    collections::VecDeque,
    future::Future,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// HTTP-ish method carried by a [`Request`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

/// Request handed to the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    /// Server-relative path, for example `/posts?page=2`.
    pub path: String,
    /// Optional JSON body.
    pub body: Option<serde_json::Value>,
}

impl Request {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            body: Some(body),
        }
    }

    pub fn put(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::Put,
            path: path.into(),
            body: Some(body),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            method: Method::Delete,
            path: path.into(),
            body: None,
        }
    }
}

/// Successful transport result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawResponse {
    /// HTTP status code (2xx for the success path).
    pub status: u16,
    /// Decoded JSON body.
    pub body: serde_json::Value,
}

impl RawResponse {
    pub fn ok(body: serde_json::Value) -> Self {
        Self { status: 200, body }
    }
}

/// Transport failure as observed at the seam, before classification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("transport failure (status={status_code:?}, abort={abort_code:?}): {}", self.body_message.as_deref().unwrap_or("no message"))]
pub struct RawFailure {
    /// Whether any HTTP response was received at all.
    pub has_response: bool,
    /// Status code when a response was received.
    pub status_code: Option<u16>,
    /// Abort/cancellation code when the request was cut short locally.
    pub abort_code: Option<String>,
    /// Best-effort message extracted from the response body.
    pub body_message: Option<String>,
}

impl RawFailure {
    /// Connection-level failure: nothing came back.
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            has_response: false,
            status_code: None,
            abort_code: None,
            body_message: Some(message.into()),
        }
    }

    /// Local deadline abort: nothing came back and an abort signal fired.
    pub fn timeout() -> Self {
        Self {
            has_response: false,
            status_code: None,
            abort_code: Some("timeout".to_owned()),
            body_message: None,
        }
    }

    /// HTTP-level failure with a received status code.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            has_response: true,
            status_code: Some(status),
            abort_code: None,
            body_message: Some(message.into()),
        }
    }
}

/// Abstract `send(request) -> result | failure` capability.
///
/// Implementations must be cheap to clone or share; the core threads a
/// transport through retry loops and background poll tasks.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: Request,
    ) -> impl Future<Output = Result<RawResponse, RawFailure>> + Send;
}

/// One scripted outcome consumed per [`ScriptedTransport::send`] call.
pub type ScriptedOutcome = Result<RawResponse, RawFailure>;

/// In-memory transport replaying a queue of outcomes in order.
///
/// Records every issued request so tests can assert on traffic. When
/// the script runs dry, further sends fail with a network failure.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    inner: Arc<Mutex<ScriptState>>,
}

#[derive(Default)]
struct ScriptState {
    outcomes: VecDeque<ScriptedOutcome>,
    requests: Vec<Request>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next outcome to replay.
    pub fn push(&self, outcome: ScriptedOutcome) {
        self.with_state(|state| state.outcomes.push_back(outcome));
    }

    /// Queue a successful JSON response.
    pub fn push_ok(&self, body: serde_json::Value) {
        self.push(Ok(RawResponse::ok(body)));
    }

    /// Queue a failure outcome.
    pub fn push_failure(&self, failure: RawFailure) {
        self.push(Err(failure));
    }

    /// All requests issued so far, in order.
    pub fn requests(&self) -> Vec<Request> {
        self.with_state(|state| state.requests.clone())
    }

    /// Number of outcomes still queued.
    pub fn remaining(&self) -> usize {
        self.with_state(|state| state.outcomes.len())
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ScriptState) -> R) -> R {
        let mut state = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        f(&mut state)
    }
}

impl Transport for ScriptedTransport {
    async fn send(&self, request: Request) -> Result<RawResponse, RawFailure> {
        self.with_state(|state| {
            state.requests.push(request);
            state
                .outcomes
                .pop_front()
                .unwrap_or_else(|| Err(RawFailure::network("scripted transport exhausted")))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn replays_outcomes_in_order() {
        let transport = ScriptedTransport::new();
        transport.push_ok(json!({"items": []}));
        transport.push_failure(RawFailure::http(500, "boom"));

        let first = transport
            .send(Request::get("/posts"))
            .await
            .expect("first outcome should be success");
        assert_eq!(first.status, 200);

        let second = transport
            .send(Request::get("/posts"))
            .await
            .expect_err("second outcome should be failure");
        assert_eq!(second.status_code, Some(500));
    }

    #[tokio::test]
    async fn records_issued_requests() {
        let transport = ScriptedTransport::new();
        transport.push_ok(json!({}));
        transport
            .send(Request::post("/posts/7/like", json!({"liked": true})))
            .await
            .expect("scripted success");

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, Method::Post);
        assert_eq!(requests[0].path, "/posts/7/like");
    }

    #[tokio::test]
    async fn exhausted_script_fails_as_network() {
        let transport = ScriptedTransport::new();
        let err = transport
            .send(Request::get("/posts"))
            .await
            .expect_err("empty script must fail");
        assert!(!err.has_response);
        assert_eq!(err.abort_code, None);
    }

    #[test]
    fn failure_constructors_set_shape() {
        let network = RawFailure::network("refused");
        assert!(!network.has_response);

        let timeout = RawFailure::timeout();
        assert!(!timeout.has_response);
        assert_eq!(timeout.abort_code.as_deref(), Some("timeout"));

        let http = RawFailure::http(429, "slow down");
        assert!(http.has_response);
        assert_eq!(http.status_code, Some(429));
    }
}
