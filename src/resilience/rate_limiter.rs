//! Sliding-window rate limiting, one bucket per named collaborator.
//!
//! A bucket counts the requests issued in the trailing window
//! `(now - window, now]`. [`RateLimiter::acquire`] holds the bucket's async
//! mutex while it waits, so callers queue up in arrival order and the count
//! is never observed above `max_requests`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::error::RelayError;

/// Request-rate ceiling for a single collaborator.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    max_requests: usize,
    window: Duration,
    requests: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter allowing `max_requests` per `window`.
    ///
    /// A zero `max_requests` or a zero window would make every caller wait
    /// forever (or never), so both are rejected here.
    pub fn new(
        name: impl Into<String>,
        max_requests: u32,
        window: Duration,
    ) -> Result<Self, RelayError> {
        let name = name.into();
        if max_requests == 0 {
            return Err(RelayError::config(format!(
                "rate limit '{name}': max_requests must be at least 1"
            )));
        }
        if window.is_zero() {
            return Err(RelayError::config(format!(
                "rate limit '{name}': window must be greater than zero"
            )));
        }
        Ok(Self {
            name,
            max_requests: max_requests as usize,
            window,
            requests: Mutex::new(VecDeque::with_capacity(max_requests as usize)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Waits until one more request fits in the trailing window, then records it.
    pub async fn acquire(&self) {
        let mut requests = self.requests.lock().await;
        loop {
            let now = Instant::now();
            while let Some(&oldest) = requests.front() {
                if oldest + self.window <= now {
                    requests.pop_front();
                } else {
                    break;
                }
            }

            if requests.len() < self.max_requests {
                requests.push_back(now);
                return;
            }

            // Full window: sleep until the oldest entry ages out, then look again.
            let wait = requests
                .front()
                .map(|&oldest| (oldest + self.window).saturating_duration_since(now))
                .unwrap_or_default();
            debug!(
                collaborator = %self.name,
                wait_ms = wait.as_millis() as u64,
                "rate limit reached, waiting"
            );
            sleep(wait).await;
        }
    }

    /// Forgets every recorded request.
    pub async fn reset(&self) {
        self.requests.lock().await.clear();
    }

    /// Number of requests currently counted against the window.
    pub async fn in_window(&self) -> usize {
        let now = Instant::now();
        let requests = self.requests.lock().await;
        requests
            .iter()
            .filter(|&&t| t + self.window > now)
            .count()
    }
}

/// All rate limiters of one process, keyed by collaborator name.
///
/// Built once at startup and handed to whichever component needs throttling.
#[derive(Debug, Default, Clone)]
pub struct RateLimiterRegistry {
    limiters: HashMap<String, Arc<RateLimiter>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from the `[rate_limits.*]` tables of the config file.
    pub fn from_config(limits: &BTreeMap<String, RateLimitConfig>) -> Result<Self, RelayError> {
        let mut registry = Self::new();
        for (name, limit) in limits {
            registry.register(name.clone(), limit.max_requests, limit.window())?;
        }
        Ok(registry)
    }

    /// Adds (or replaces) the limiter for `name`.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        max_requests: u32,
        window: Duration,
    ) -> Result<Arc<RateLimiter>, RelayError> {
        let name = name.into();
        let limiter = Arc::new(RateLimiter::new(name.clone(), max_requests, window)?);
        self.limiters.insert(name, Arc::clone(&limiter));
        Ok(limiter)
    }

    /// Returns a shared handle to the limiter registered under `name`.
    pub fn limiter(&self, name: &str) -> Result<Arc<RateLimiter>, RelayError> {
        self.limiters
            .get(name)
            .cloned()
            .ok_or_else(|| RelayError::UnknownRateLimit(name.to_string()))
    }

    pub async fn acquire(&self, name: &str) -> Result<(), RelayError> {
        self.limiter(name)?.acquire().await;
        Ok(())
    }

    pub async fn reset(&self, name: &str) -> Result<(), RelayError> {
        self.limiter(name)?.reset().await;
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.limiters.keys().map(String::as_str)
    }
}
