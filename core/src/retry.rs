//! Bounded retry-on-429 around a single upstream call.
//!
//! [`RetryCoordinator::call`] wraps exactly one logical call (one command
//! batch, or one per-task mutation):
//!
//! ```text
//! Attempting -> Success
//!            -> RateLimited -> Waiting -> Attempting
//!            -> OtherError  -> Failed
//! ```
//!
//! Only HTTP 429 is retried. Any other status is handed back to the caller
//! untouched for interpretation, and transport failures propagate at once.
//! Before every attempt the shared [`RateLimitTracker`] is consulted, so a
//! 429 seen by one call also pauses its siblings in the same budget class.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{classify_status, EngineError};
use crate::http::HttpResponse;
use crate::ratelimit::{advertised_wait, BudgetClass, RateLimitTracker};
use crate::transport::TransportError;

/// Retry/back-off configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Delay after the first 429 when no wait is advertised.
    pub base_delay: Duration,
    /// Cap for computed (not advertised) delays.
    pub max_delay: Duration,
    /// Sleep for the upstream's advertised wait when there is one.
    pub respect_retry_after: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            respect_retry_after: true,
        }
    }
}

impl RetryPolicy {
    /// Wait before the attempt following `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32, advertised: Option<Duration>) -> Duration {
        if self.respect_retry_after {
            if let Some(wait) = advertised {
                return wait;
            }
        }
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("still rate limited after {attempts} attempts")]
    RateLimited {
        attempts: u32,
        retry_after: Option<Duration>,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Waiting any longer would overrun the invocation deadline.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl From<RetryError> for EngineError {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::RateLimited { retry_after, .. } => EngineError::RateLimited { retry_after },
            RetryError::Transport(e) => EngineError::Transport(e),
            RetryError::DeadlineExceeded => EngineError::DeadlineExceeded,
        }
    }
}

pub struct RetryCoordinator<'a> {
    policy: &'a RetryPolicy,
    tracker: &'a RateLimitTracker,
}

impl<'a> RetryCoordinator<'a> {
    pub fn new(policy: &'a RetryPolicy, tracker: &'a RateLimitTracker) -> Self {
        Self { policy, tracker }
    }

    /// Runs `op` until it yields a non-429 response, the attempt budget is
    /// spent, or waiting would pass `deadline`.
    pub async fn call<F, Fut>(
        &self,
        class: BudgetClass,
        deadline: Option<Instant>,
        mut op: F,
    ) -> Result<HttpResponse, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<HttpResponse, TransportError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;

            let admission = self.tracker.consume(class);
            if !admission.allowed {
                let wait = admission.wait_hint.unwrap_or(self.policy.base_delay);
                tracing::debug!(
                    %class,
                    wait_ms = wait.as_millis() as u64,
                    "budget paused, waiting before call"
                );
                self.sleep_within(deadline, wait).await?;
            }

            let response = op().await?;
            self.tracker
                .observe(class, response.status, &response.headers);

            if !classify_status(response.status).is_retryable() {
                if attempt > 1 {
                    tracing::debug!(%class, attempt, "call succeeded after retry");
                }
                return Ok(response);
            }

            let advertised = advertised_wait(&response);
            let wait = self.policy.delay_for(attempt, advertised);
            self.tracker.mark_limited(class, wait);

            if attempt >= max_attempts {
                tracing::warn!(
                    %class,
                    attempts = attempt,
                    "retry budget exhausted while rate limited"
                );
                return Err(RetryError::RateLimited {
                    attempts: attempt,
                    retry_after: advertised,
                });
            }

            tracing::warn!(
                %class,
                attempt,
                wait_ms = wait.as_millis() as u64,
                "rate limited, retrying"
            );
            self.sleep_within(deadline, wait).await?;
        }
    }

    async fn sleep_within(
        &self,
        deadline: Option<Instant>,
        wait: Duration,
    ) -> Result<(), RetryError> {
        if let Some(deadline) = deadline {
            let fits = Instant::now()
                .checked_add(wait)
                .is_some_and(|end| end <= deadline);
            if !fits {
                return Err(RetryError::DeadlineExceeded);
            }
        }
        tokio::time::sleep(wait).await;
        Ok(())
    }
}
