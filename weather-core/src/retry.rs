//! Bounded retries with exponential backoff and jitter.
//!
//! Work handed to [`RetryExecutor::execute`] reports failures as values
//! classified through [`Classify`]. Only [`ErrorClass::Transient`] failures are
//! retried; a [`ErrorClass::Permanent`] failure is returned immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_JITTER_FRACTION: f64 = 0.5;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth another attempt: timeouts, connection failures, 5xx.
    Transient,
    /// Retrying cannot help: unknown city, rejected request.
    Permanent,
}

pub trait Classify {
    fn class(&self) -> ErrorClass;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound of the random extra delay, as a fraction of the base (0..=1).
    pub jitter_fraction: f64,
    /// Cap on the exponential base before jitter is added.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay before attempt `attempt` (1-based): `base * 2^(attempt-2)`.
    /// The first attempt never waits.
    pub fn base_delay_before(&self, attempt: u32) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 2);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay before `attempt`, scaled by a uniform multiplier in `[1, 1 + jitter_fraction]`.
    /// A non-finite `jitter_fraction` disables jitter.
    pub fn delay_before(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let base = self.base_delay_before(attempt);
        let jitter = if self.jitter_fraction.is_finite() {
            self.jitter_fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let multiplier = rng.gen_range(1.0..=1.0 + jitter);
        base.mul_f64(multiplier)
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("permanent failure: {0}")]
    Permanent(E),

    #[error("retries exhausted after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Permanent(e) | RetryError::Exhausted { last: e, .. } => e,
        }
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

    /// Runs `operation` until it succeeds, fails permanently or the attempt
    /// budget is spent. Each wait is an async sleep local to this call.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        E: Classify + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(attempt, "succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(err) if err.class() == ErrorClass::Permanent => {
                    tracing::debug!(attempt, error = %err, "permanent failure, not retrying");
                    return Err(RetryError::Permanent(err));
                }
                Err(err) if attempt >= max_attempts => {
                    tracing::warn!(attempts = attempt, error = %err, "all retry attempts exhausted");
                    return Err(RetryError::Exhausted { attempts: attempt, last: err });
                }
                Err(err) => {
                    attempt += 1;
                    let delay = self.policy.delay_before(attempt, &mut rand::thread_rng());
                    tracing::warn!(
                        error = %err,
                        next_attempt = attempt,
                        max_attempts,
                        ?delay,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
