//! Retry executor: exponential backoff with jitter around a single API call.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::RunContext;
use crate::error::{CallError, EnumerateError};

/// Server `reason` values that ask the client to back off and try again.
const DELAY_REASONS: &[&str] = &["TooManyRequests", "ServerTimeout", "Timeout", "ServiceUnavailable"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    pub factor: f64,
    /// Upper bound for a single backoff step (before jitter).
    pub max_step: Duration,
    /// Total attempts, including the first.
    pub steps: u32,
    /// Relative jitter, applied as +/- `jitter * delay`.
    pub jitter: f64,
    /// Budget for one attempt.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 2.0,
            max_step: Duration::from_secs(15),
            steps: 5,
            jitter: 0.1,
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry `n` (0-based), capped, without jitter.
    pub fn base_delay(&self, n: u32) -> Duration {
        let secs = self.initial.as_secs_f64() * self.factor.powi(n as i32);
        Duration::from_secs_f64(secs.min(self.max_step.as_secs_f64()))
    }

    pub fn delay(&self, n: u32) -> Duration {
        let base = self.base_delay(n);
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        base.mul_f64((1.0 + spread).max(0.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Retry,
    Fatal,
}

/// Decide whether a failed attempt is worth another try.
pub fn classify(err: &CallError) -> Verdict {
    match err {
        CallError::TimedOut(_) => Verdict::Retry,
        CallError::Kube(kube::Error::Api(resp)) => {
            if resp.code == 429 || resp.code >= 500 || DELAY_REASONS.contains(&resp.reason.as_str()) {
                Verdict::Retry
            } else {
                Verdict::Fatal
            }
        }
        CallError::Kube(kube::Error::HyperError(_)) | CallError::Kube(kube::Error::Service(_)) => Verdict::Retry,
        CallError::Kube(_) => Verdict::Fatal,
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails fatally, exhausts the step budget, or `ctx` fires.
    pub async fn execute<T, F, Fut>(&self, ctx: &RunContext, operation: &str, mut op: F) -> Result<T, EnumerateError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, kube::Error>>,
    {
        let steps = self.policy.steps.max(1);
        let mut last_error: Option<String> = None;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if let Some(reason) = ctx.stop_reason() {
                return Err(EnumerateError::Interrupted { operation: operation.to_string(), reason, last_error });
            }
            let err = tokio::select! {
                reason = ctx.done() => {
                    return Err(EnumerateError::Interrupted { operation: operation.to_string(), reason, last_error });
                }
                res = tokio::time::timeout(self.policy.call_timeout, op()) => match res {
                    Ok(Ok(value)) => {
                        if attempt > 1 {
                            debug!(operation, attempt, "succeeded after retry");
                        }
                        return Ok(value);
                    }
                    Ok(Err(e)) => CallError::Kube(e),
                    Err(_) => CallError::TimedOut(self.policy.call_timeout),
                },
            };

            if classify(&err) == Verdict::Fatal {
                debug!(operation, attempt, error = %err, "non-retriable error");
                return Err(EnumerateError::Failed { operation: operation.to_string(), source: err });
            }
            metrics::counter!("census_retries_total", 1u64, "code" => err.status_code().unwrap_or(0).to_string());
            if let CallError::Kube(kube::Error::Api(resp)) = &err {
                if resp.code == 429 {
                    // kube's ErrorResponse does not carry Retry-After; the server's hint, if any, is in the message.
                    warn!(operation, attempt, reason = %resp.reason, hint = %resp.message, "rate limited by API server");
                }
            }
            if attempt >= steps {
                warn!(operation, attempts = attempt, error = %err, "retry budget exhausted");
                return Err(EnumerateError::RetriesExhausted { operation: operation.to_string(), attempts: attempt, source: err });
            }

            let delay = self.policy.delay(attempt - 1);
            warn!(operation, attempt, max_attempts = steps, delay_ms = delay.as_millis() as u64, error = %err, "retriable error, backing off");
            last_error = Some(err.to_string());
            tokio::select! {
                reason = ctx.done() => {
                    return Err(EnumerateError::Interrupted { operation: operation.to_string(), reason, last_error });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
