//! The work queue seen from the dispatcher: list pending items, move their status.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::RelayError;
use crate::model::{WorkItem, WorkStatus};
use crate::resilience::{RateLimiter, RetryPolicy, retry};

/// External system of record for work items.
///
/// Implementations do not retry or throttle on their own; callers wrap them
/// in [`ResilientSource`] when they want that.
#[async_trait]
pub trait WorkSource: Send + Sync {
    /// Items whose status is `Pending`, in the order they should be dispatched.
    async fn query_pending(&self) -> Result<Vec<WorkItem>, RelayError>;

    /// Records a status change, optionally pointing at where the result lives.
    async fn update_status(
        &self,
        id: &str,
        status: WorkStatus,
        result_ref: Option<&str>,
    ) -> Result<(), RelayError>;

    async fn health_check(&self) -> bool {
        true
    }
}

#[async_trait]
impl<S: WorkSource + ?Sized> WorkSource for Arc<S> {
    async fn query_pending(&self) -> Result<Vec<WorkItem>, RelayError> {
        (**self).query_pending().await
    }

    async fn update_status(
        &self,
        id: &str,
        status: WorkStatus,
        result_ref: Option<&str>,
    ) -> Result<(), RelayError> {
        (**self).update_status(id, status, result_ref).await
    }

    async fn health_check(&self) -> bool {
        (**self).health_check().await
    }
}

/// Applies a rate limit and a retry policy around every call to `inner`.
pub struct ResilientSource<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
}

impl<S: WorkSource> ResilientSource<S> {
    pub fn new(inner: S, limiter: Arc<RateLimiter>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            limiter,
            policy,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: WorkSource> WorkSource for ResilientSource<S> {
    async fn query_pending(&self) -> Result<Vec<WorkItem>, RelayError> {
        retry(&self.policy, move || async move {
            self.limiter.acquire().await;
            self.inner.query_pending().await
        })
        .await
    }

    async fn update_status(
        &self,
        id: &str,
        status: WorkStatus,
        result_ref: Option<&str>,
    ) -> Result<(), RelayError> {
        retry(&self.policy, move || async move {
            self.limiter.acquire().await;
            self.inner.update_status(id, status, result_ref).await
        })
        .await
    }

    async fn health_check(&self) -> bool {
        self.limiter.acquire().await;
        self.inner.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    struct FlakySource {
        query_failures: u32,
        queries: AtomicU32,
        updates: AtomicU32,
    }

    #[async_trait]
    impl WorkSource for FlakySource {
        async fn query_pending(&self) -> Result<Vec<WorkItem>, RelayError> {
            let n = self.queries.fetch_add(1, Ordering::SeqCst);
            if n < self.query_failures {
                Err(RelayError::Source("502 bad gateway".into()))
            } else {
                Ok(vec![WorkItem::new("q-1", "first question")])
            }
        }

        async fn update_status(
            &self,
            id: &str,
            _status: WorkStatus,
            _result_ref: Option<&str>,
        ) -> Result<(), RelayError> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            Err(RelayError::ItemNotFound(id.to_string()))
        }
    }

    fn resilient(query_failures: u32, max_requests: u32) -> ResilientSource<FlakySource> {
        ResilientSource::new(
            FlakySource {
                query_failures,
                queries: AtomicU32::new(0),
                updates: AtomicU32::new(0),
            },
            Arc::new(RateLimiter::new("queue", max_requests, Duration::from_secs(1)).unwrap()),
            RetryPolicy::new(3, Duration::from_millis(100), 2.0).unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn transient_query_failures_are_retried() {
        let source = resilient(2, 10);
        let items = source.query_pending().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(source.inner().queries.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_update_failures_are_not_retried() {
        let source = resilient(0, 10);
        let err = source
            .update_status("q-9", WorkStatus::Completed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::ItemNotFound(_)));
        assert_eq!(source.inner().updates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn every_attempt_goes_through_the_rate_limit() {
        // One request per second: three attempts need two extra seconds of
        // throttling on top of the 100ms + 200ms backoff.
        let source = resilient(2, 1);
        let start = Instant::now();
        source.query_pending().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
