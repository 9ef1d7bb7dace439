use crate::error::{classify, is_marked_non_retryable};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// No backoff is started that would end after this instant.
    pub deadline: Option<Instant>,
}

impl RetryPolicy {
    pub const fn new(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            backoff_multiplier,
            deadline: None,
        }
    }

    pub fn until(self, deadline: Option<Instant>) -> Self {
        Self { deadline, ..self }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.backoff_multiplier).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, Duration::from_millis(1000), Duration::from_millis(10_000), 2.0)
    }
}

/// Runs `operation` until it succeeds, the attempts run out, or it fails
/// with a [`PipelineError`](crate::error::PipelineError) whose retryable flag
/// is cleared. The classification is only logged. The last error is returned
/// as is.
pub async fn with_retry<T, F, Fut>(label: &str, policy: &RetryPolicy, mut operation: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut delay = policy.base_delay;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        info!(operation = label, attempt, "attempting");

        let err = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(operation = label, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        let classification = classify(&err);
        if attempt > policy.max_retries {
            error!(
                operation = label,
                attempts = attempt,
                kind = %classification.kind,
                error = %format!("{err:#}"),
                "failed after all attempts"
            );
            return Err(err);
        }
        if is_marked_non_retryable(&err) {
            error!(
                operation = label,
                attempt,
                kind = %classification.kind,
                error = %format!("{err:#}"),
                "failed with non-retryable error"
            );
            return Err(err);
        }
        if let Some(deadline) = policy.deadline {
            if Instant::now() + delay >= deadline {
                warn!(
                    operation = label,
                    attempt,
                    error = %format!("{err:#}"),
                    "no time left before the deadline, giving up"
                );
                return Err(err);
            }
        }

        warn!(
            operation = label,
            attempt,
            delay_ms = delay.as_millis() as u64,
            kind = %classification.kind,
            error = %format!("{err:#}"),
            "failed, retrying"
        );
        sleep(delay).await;
        delay = policy.next_delay(delay);
    }
}
