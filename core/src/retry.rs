//! Retry policy for external-service calls.
//!
//! Network faults, command timeouts, and 5xx responses back off
//! exponentially (1 s initial, factor 2, 30 s cap, at most 3 attempts, with
//! jitter). Rate limits are not retried on the backoff curve: the wait is
//! the server-provided `retry_after`, capped at 60 s. Everything else is
//! terminal on the first failure.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracebot_protocol::Result;
use tracebot_protocol::TriageErr;
use tracing::warn;

use crate::metrics::MetricsRegistry;

/// Hard cap on how long a server-directed rate-limit wait may stall a
/// pipeline task.
pub const RATE_LIMIT_WAIT_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Jittered exponential delay before attempt `attempt + 1` (the first
    /// attempt is numbered 1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.saturating_sub(1) as i32);
        let base = self.initial_delay.as_secs_f64() * exp;
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = rand::rng().random_range(0.9..1.1);
        Duration::from_secs_f64(capped * jitter)
    }

    fn delay_for(&self, err: &TriageErr, attempt: u32) -> Option<Duration> {
        if let Some(retry_after) = err.retry_after() {
            return Some(retry_after.min(RATE_LIMIT_WAIT_CAP));
        }
        if err.is_retryable() {
            return Some(self.backoff(attempt));
        }
        None
    }
}

/// Drive `attempt_fn` until it succeeds, the error is terminal, or attempts
/// run out. Sleeps are cancellation-aware.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    op: &'static str,
    metrics: Option<&MetricsRegistry>,
    mut attempt_fn: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for attempt in 1..=policy.max_attempts {
        let started = std::time::Instant::now();
        let outcome = attempt_fn().await;
        if let Some(metrics) = metrics {
            metrics.observe_duration("external_call_seconds", &[("op", op)], started.elapsed());
        }
        match outcome {
            Ok(value) => return Ok(value),
            Err(err) => {
                let delay = policy.delay_for(&err, attempt);
                let exhausted = attempt == policy.max_attempts;
                let Some(delay) = delay else {
                    return Err(err);
                };
                if exhausted {
                    return Err(err);
                }

                if let Some(metrics) = metrics {
                    metrics.inc_counter(
                        "external_retries_total",
                        &[("op", op), ("kind", err.kind())],
                        1,
                    );
                }
                warn!(op, attempt, ?delay, kind = err.kind(), "retrying external call");

                tokio::select! {
                    _ = cancel.cancelled() => return Err(TriageErr::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    unreachable!("retry loop always returns within max_attempts")
}
