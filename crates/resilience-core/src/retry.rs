use std::{future::Future, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    classifier::ErrorClassifier,
    error::{ClassifiedError, RawError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after failed attempt number `attempt` (0-based): `base * 2^attempt`,
    /// raised to the retry hint when larger, capped at `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32, retry_after_hint_ms: Option<u64>) -> Duration {
        let shift = attempt.min(20);
        let multiplier = 1_u64 << shift;
        let calculated = self.base_delay_ms.saturating_mul(multiplier);
        let hinted = retry_after_hint_ms.unwrap_or(0);
        let bounded = calculated.max(hinted).min(self.max_delay_ms);
        Duration::from_millis(bounded)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1_000, 30_000, 3)
    }
}

/// Per-call parameters for [`RetryExecutor::run`].
#[derive(Debug, Clone)]
pub struct RetryScope<'a> {
    /// Operation label used in classification and logs.
    pub context: &'a str,
    pub user_id: Option<&'a str>,
    /// Deadline applied to each attempt.
    pub timeout: Duration,
    /// Cancelled when the governing operation is abandoned.
    pub cancel: CancellationToken,
}

impl<'a> RetryScope<'a> {
    pub fn new(context: &'a str, timeout: Duration) -> Self {
        Self {
            context,
            user_id: None,
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_user(mut self, user_id: Option<&'a str>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Runs fallible async operations with bounded retries and exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    classifier: Arc<ErrorClassifier>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, classifier: Arc<ErrorClassifier>) -> Self {
        Self { policy, classifier }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `operation` until it succeeds, a non-retryable error occurs, or the
    /// attempt budget is spent. Returns the last classified error on failure.
    ///
    /// Cancellation stops further scheduling. An attempt already in flight is
    /// awaited to completion and its result discarded.
    pub async fn run<T, F, Fut>(
        &self,
        scope: RetryScope<'_>,
        mut operation: F,
    ) -> Result<T, ClassifiedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RawError>>,
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempt: u32 = 0;

        loop {
            if scope.cancel.is_cancelled() {
                return Err(self.cancelled(&scope));
            }
            attempt += 1;

            let outcome = match tokio::time::timeout(scope.timeout, operation()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(RawError::Timeout {
                    after_ms: scope.timeout.as_millis() as u64,
                }),
            };

            if scope.cancel.is_cancelled() {
                debug!(context = scope.context, attempt, "discarding result of abandoned attempt");
                return Err(self.cancelled(&scope));
            }

            let raw = match outcome {
                Ok(value) => return Ok(value),
                Err(raw) => raw,
            };

            let classified = self
                .classifier
                .classify_silent(&raw, scope.context, scope.user_id);
            if attempt >= max_attempts || !classified.is_retryable() {
                return Err(classified);
            }

            let delay = self
                .policy
                .delay_for_attempt(attempt - 1, classified.retry_after_ms);
            warn!(
                context = scope.context,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                kind = %classified.kind,
                "attempt failed; retrying"
            );

            tokio::select! {
                _ = scope.cancel.cancelled() => return Err(self.cancelled(&scope)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn cancelled(&self, scope: &RetryScope<'_>) -> ClassifiedError {
        ClassifiedError::cancelled(scope.context, self.classifier.now_ms())
    }
}
