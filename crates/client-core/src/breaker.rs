use std::{future::Future, time::Duration};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ClientError;

/// Breaker lifecycle state.
///
/// Legal transitions: Closed→Open (threshold consecutive failures),
/// Open→HalfOpen (cooldown elapsed), HalfOpen→Closed (trial success),
/// HalfOpen→Open (trial failure).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Guard that stops invoking a failing downstream resource class.
///
/// One shared instance guards one resource class; failures anywhere
/// against that class count globally.
#[derive(Debug)]
pub struct CircuitBreaker {
    resource: String,
    threshold: u32,
    timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker opening after `threshold` consecutive failures
    /// and cooling down for `timeout` before admitting a trial call.
    pub fn new(resource: impl Into<String>, threshold: u32, timeout: Duration) -> Self {
        Self {
            resource: resource.into(),
            threshold: threshold.max(1),
            timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Run `op` under the breaker.
    ///
    /// While open, calls are rejected with a synthetic retryable
    /// `resource_unavailable` error without invoking `op`. After the
    /// cooldown, exactly one trial call is admitted; concurrent calls
    /// during the trial are rejected.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, ClientError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let is_trial = match self.admit() {
            Admission::Pass => false,
            Admission::Trial => true,
            Admission::Reject => return Err(ClientError::unavailable(&self.resource)),
        };

        match op().await {
            Ok(value) => {
                self.on_success(is_trial);
                Ok(value)
            }
            Err(err) => {
                self.on_failure(is_trial);
                Err(err)
            }
        }
    }

    fn admit(&self) -> Admission {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Admission::Pass,
            CircuitState::Open => {
                let cooled_down = inner
                    .last_failure_at
                    .is_some_and(|at| at.elapsed() >= self.timeout);
                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    debug!(resource = %self.resource, "circuit half-open, admitting trial");
                    Admission::Trial
                } else {
                    Admission::Reject
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Admission::Reject
                } else {
                    inner.trial_in_flight = true;
                    Admission::Trial
                }
            }
        }
    }

    fn on_success(&self, is_trial: bool) {
        let mut inner = self.inner.lock();
        if is_trial {
            debug!(resource = %self.resource, "trial succeeded, circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure_at = None;
        inner.trial_in_flight = false;
    }

    fn on_failure(&self, is_trial: bool) {
        let mut inner = self.inner.lock();
        inner.last_failure_at = Some(Instant::now());
        inner.trial_in_flight = false;

        if is_trial {
            inner.state = CircuitState::Open;
            warn!(resource = %self.resource, "trial failed, circuit re-opened");
            return;
        }

        inner.failure_count = inner.failure_count.saturating_add(1);
        if inner.state == CircuitState::Closed && inner.failure_count >= self.threshold {
            inner.state = CircuitState::Open;
            warn!(
                resource = %self.resource,
                failure_count = inner.failure_count,
                "failure threshold reached, circuit opened"
            );
        }
    }
}

enum Admission {
    Pass,
    Trial,
    Reject,
}
