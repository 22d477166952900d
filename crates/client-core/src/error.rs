use std::time::{SystemTime, UNIX_EPOCH};

use client_transport::RawFailure;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed failure taxonomy produced by [`classify`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Connection-level failure, nothing came back.
    Network,
    /// Local deadline abort before any response.
    Timeout,
    /// 401: the session is missing or expired.
    Authentication,
    /// 403: the session is valid but not allowed.
    Authorization,
    /// 404: the target no longer exists.
    NotFound,
    /// 429: throttled by the server.
    RateLimit,
    /// Server-side input rejection.
    Validation,
    /// 5xx: server-side fault.
    ServerFault,
    /// Other 4xx client error.
    BadRequest,
    /// Anything the rules above do not cover.
    Unknown,
}

impl ErrorClass {
    /// Whether a retry of the failed operation may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimit | Self::ServerFault
        )
    }

    /// Stable label used in diagnostics breakdowns and logs.
    pub fn label(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Authentication => "authentication",
            Self::Authorization => "authorization",
            Self::NotFound => "not_found",
            Self::RateLimit => "rate_limit",
            Self::Validation => "validation",
            Self::ServerFault => "server_fault",
            Self::BadRequest => "bad_request",
            Self::Unknown => "unknown",
        }
    }
}

/// One classified failure, as retained by the diagnostics ring buffer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorRecord {
    /// Wall-clock capture time in milliseconds since the Unix epoch.
    pub at_ms: u64,
    pub classification: ErrorClass,
    pub retryable: bool,
    pub http_status: Option<u16>,
    pub message: String,
}

/// Map a raw transport failure into the closed taxonomy.
///
/// Rules apply in order: no response + abort signal is a timeout, no
/// response is a network failure, then status-code buckets.
pub fn classify(failure: &RawFailure) -> ErrorRecord {
    let classification = if !failure.has_response {
        if failure.abort_code.is_some() {
            ErrorClass::Timeout
        } else {
            ErrorClass::Network
        }
    } else {
        match failure.status_code {
            Some(401) => ErrorClass::Authentication,
            Some(403) => ErrorClass::Authorization,
            Some(404) => ErrorClass::NotFound,
            Some(429) => ErrorClass::RateLimit,
            Some(status) if status >= 500 => ErrorClass::ServerFault,
            Some(status) if (400..500).contains(&status) => ErrorClass::BadRequest,
            _ => ErrorClass::Unknown,
        }
    };

    ErrorRecord {
        at_ms: now_unix_ms(),
        classification,
        retryable: classification.is_retryable(),
        http_status: failure.status_code,
        message: failure
            .body_message
            .clone()
            .unwrap_or_else(|| format!("{} failure", classification.label())),
    }
}

/// Stable error payload propagated out of the client core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{}:{code}: {message}", classification.label())]
pub struct ClientError {
    pub classification: ErrorClass,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    pub http_status: Option<u16>,
}

impl ClientError {
    pub fn new(
        classification: ErrorClass,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            classification,
            code: code.into(),
            message: message.into(),
            http_status: None,
        }
    }

    /// Build from an already-classified record.
    pub fn from_record(record: &ErrorRecord) -> Self {
        Self {
            classification: record.classification,
            code: record.classification.label().to_owned(),
            message: record.message.clone(),
            http_status: record.http_status,
        }
    }

    /// Synthetic rejection emitted by an open circuit breaker.
    pub fn unavailable(resource: &str) -> Self {
        Self::new(
            ErrorClass::Network,
            "resource_unavailable",
            format!("'{resource}' is unavailable (circuit open)"),
        )
    }

    /// A timer or retry sequence was cancelled before resolving.
    pub fn cancelled(action: &str) -> Self {
        Self::new(
            ErrorClass::Unknown,
            "cancelled",
            format!("'{action}' was cancelled"),
        )
    }

    /// Internal invariant break or codec failure.
    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Unknown, code, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.classification.is_retryable()
    }
}

pub(crate) fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
