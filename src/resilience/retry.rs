//! Exponential-backoff retries as an explicit policy value.
//!
//! A [`RetryPolicy`] is plain data: it can be loaded from config, compared in
//! tests and applied around any call site with [`retry`] or [`retry_if`].
//! The wrapped error is returned untouched once attempts run out.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::error::RelayError;

/// Classifies an error as transient (worth another attempt) or permanent.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Backoff schedule for a fallible operation.
///
/// The delay after failed attempt `n` (1-based) is
/// `initial_delay * backoff_factor^(n - 1)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(
        default = "default_initial_delay",
        with = "crate::model::duration_millis",
        rename = "initial_delay_ms"
    )]
    pub initial_delay: Duration,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl RetryPolicy {
    /// Creates a validated policy.
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        backoff_factor: f64,
    ) -> Result<Self, RelayError> {
        let policy = Self {
            max_attempts,
            initial_delay,
            backoff_factor,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = if factor.is_finite() { factor.max(1.0) } else { 1.0 };
        self
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.max_attempts == 0 {
            return Err(RelayError::config("retry: max_attempts must be at least 1"));
        }
        if self.initial_delay.is_zero() {
            return Err(RelayError::config(
                "retry: initial_delay must be greater than zero",
            ));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(RelayError::config("retry: backoff_factor must be >= 1"));
        }
        Ok(())
    }

    /// Delay to wait after failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

/// Runs `op` under `policy`, retrying errors that report themselves retryable.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, op: F) -> Result<T, E>
where
    E: Retryable + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_if(policy, |e: &E| e.is_retryable(), op).await
}

/// Runs `op` under `policy`, retrying only errors accepted by `should_retry`.
///
/// `op` is invoked at most `max_attempts` times and there is no sleep after
/// the last attempt. Dropping the returned future (for example when the
/// caller is cancelled mid-backoff) stops the retries; nothing is detached.
pub async fn retry_if<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    mut should_retry: P,
    mut op: F,
) -> Result<T, E>
where
    E: Display,
    P: FnMut(&E) -> bool,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !should_retry(&e) => {
                debug!(attempt, error = %e, "non-retryable error");
                return Err(e);
            }
            Err(e) if attempt >= max_attempts => {
                error!(attempts = max_attempts, error = %e, "giving up after retries");
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
