use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use rand::Rng;

use crate::error::{BranchError, RemoteErrorKind, RemoteFailure, Result};

// Neon allows ~700 requests/minute with bursts of 40/sec per route.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(4);
pub const DEFAULT_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_JITTER: f64 = 0.25;
pub const DEFAULT_MAX_TOTAL_DELAY: Duration = Duration::from_secs(90);

/// Floor for server-provided `Retry-After`, so a zero never spins
const MIN_RETRY_AFTER: Duration = Duration::from_millis(100);

/// Backoff configuration for remote calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the nominal delay added or removed at random
    pub jitter: f64,
    /// Cap on the summed sleep time across all retries
    pub max_total_delay: Duration,
    pub retryable: HashSet<RemoteErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            jitter: DEFAULT_JITTER,
            max_total_delay: DEFAULT_MAX_TOTAL_DELAY,
            retryable: [
                RemoteErrorKind::RateLimited,
                RemoteErrorKind::ServerError,
                RemoteErrorKind::Busy,
                RemoteErrorKind::Network,
            ]
            .into_iter()
            .collect(),
        }
    }
}

impl RetryPolicy {
    /// A policy that retries immediately; used where waiting is pointless
    /// (tests, local mocks).
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            jitter: 0.0,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_total_delay(mut self, max_total_delay: Duration) -> Self {
        self.max_total_delay = max_total_delay;
        self
    }

    pub fn is_retryable(&self, kind: RemoteErrorKind) -> bool {
        self.retryable.contains(&kind)
    }

    /// Delay before retry number `attempt` (0-indexed): exponential backoff
    /// with symmetric random jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let nominal = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let spread = if self.jitter > 0.0 {
            nominal * self.jitter * rand::thread_rng().gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        Duration::try_from_secs_f64((nominal + spread).max(0.0)).unwrap_or(self.max_total_delay)
    }

    /// Run `attempt` until it succeeds, fails with a non-retryable kind, or
    /// the attempt ceiling / total delay cap is reached.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, RemoteFailure>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempts = 0u32;
        let mut slept = Duration::ZERO;

        loop {
            attempts += 1;
            let failure = match attempt().await {
                Ok(value) => return Ok(value),
                Err(failure) => failure,
            };

            if !self.is_retryable(failure.kind) {
                debug!("{} failed with non-retryable {}", operation, failure.kind);
                return Err(BranchError::remote(operation, failure));
            }

            if attempts >= max_attempts {
                return Err(exhausted(operation, attempts, failure));
            }

            let delay = match failure.retry_after {
                Some(retry_after) => retry_after.max(MIN_RETRY_AFTER),
                None => self.delay_for(attempts - 1),
            };
            if slept + delay > self.max_total_delay {
                return Err(exhausted(operation, attempts, failure));
            }

            warn!(
                "{} failed ({}), retrying in {:.1}s (attempt {}/{})",
                operation,
                failure.kind,
                delay.as_secs_f64(),
                attempts,
                max_attempts
            );
            tokio::time::sleep(delay).await;
            slept += delay;
        }
    }
}

fn exhausted(operation: &str, attempts: u32, failure: RemoteFailure) -> BranchError {
    BranchError::RetriesExhausted {
        operation: operation.to_string(),
        attempts,
        kind: failure.kind,
        message: failure.message,
    }
}
