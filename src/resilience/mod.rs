//! Throttling and retry primitives shared by every collaborator call.
//!
//! Both are leaf utilities: [`RateLimiter`] keeps a sliding window of request
//! timestamps per collaborator, [`retry`] re-runs a fallible async operation
//! under a [`RetryPolicy`].

mod rate_limiter;
mod retry;

pub use rate_limiter::{RateLimiter, RateLimiterRegistry};
pub use retry::{RetryPolicy, Retryable, retry, retry_if};
