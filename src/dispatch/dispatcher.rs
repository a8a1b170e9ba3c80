//! Polling dispatcher with in-memory de-duplication and bounded fan-out.

use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::source::WorkSource;
use crate::error::RelayError;
use crate::model::{WorkItem, WorkStatus};

/// What happens to an item whose callback failed.
///
/// The dispatcher marks it `Failed` at the source either way; the policy only
/// decides whether this process will dispatch the same id again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedItemPolicy {
    /// Forget the id, so an operator re-queueing it gets it processed again.
    #[default]
    AllowRequeue,
    /// Remember the id as handled; it is never re-dispatched in this process.
    Quarantine,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    pub max_concurrent_tasks: usize,
    pub failed_item_policy: FailedItemPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_concurrent_tasks: 5,
            failed_item_policy: FailedItemPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.poll_interval.is_zero() {
            return Err(RelayError::config(
                "dispatcher: poll interval must be greater than zero",
            ));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(RelayError::config(
                "dispatcher: max_concurrent_tasks must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Whether the best-effort `Failed` status write after an item failure landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    Recorded,
    Failed(String),
}

/// Final state of one dispatched item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed,
    Failed {
        error: String,
        status_update: StatusUpdate,
    },
}

/// Summary of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Items the source reported as pending.
    pub discovered: usize,
    /// Items dropped because they were in flight, already handled, or repeated.
    pub skipped: usize,
    /// Outcomes in dispatch order.
    pub outcomes: Vec<(String, ItemOutcome)>,
    /// Set when the source could not be queried at all.
    pub query_error: Option<String>,
}

impl CycleReport {
    pub fn completed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| *o == ItemOutcome::Completed)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.completed()
    }
}

/// Ids currently in flight and ids already handled by this process.
/// The two sets never share an id.
#[derive(Debug, Default)]
struct DispatchRecord {
    processing: HashSet<String>,
    processed: HashSet<String>,
}

impl DispatchRecord {
    fn is_known(&self, id: &str) -> bool {
        self.processing.contains(id) || self.processed.contains(id)
    }

    fn begin(&mut self, id: &str) -> bool {
        if self.is_known(id) {
            return false;
        }
        self.processing.insert(id.to_string())
    }

    fn finish(&mut self, id: &str, handled: bool) {
        self.processing.remove(id);
        if handled {
            self.processed.insert(id.to_string());
        }
    }
}

/// Holds an id in `processing`; dropping it unresolved releases the id, so a
/// cancelled dispatch never leaves an item stuck in flight.
struct Claim<'a> {
    record: &'a Mutex<DispatchRecord>,
    id: String,
    resolved: bool,
}

impl Claim<'_> {
    fn resolve(mut self, handled: bool) {
        lock(self.record).finish(&self.id, handled);
        self.resolved = true;
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            lock(self.record).finish(&self.id, false);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}

fn lock(record: &Mutex<DispatchRecord>) -> MutexGuard<'_, DispatchRecord> {
    // The record is a pair of sets; a panic elsewhere cannot leave it half-updated.
    record.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Polls a [`WorkSource`] and hands every new pending item to a callback.
///
/// # Example
///
/// ```ignore
/// let dispatcher = PollDispatcher::new(source, DispatcherConfig::default())?;
/// dispatcher
///     .run(|item| async move {
///         println!("handling {}", item.id);
///         Ok(())
///     })
///     .await;
/// ```
pub struct PollDispatcher {
    source: Arc<dyn WorkSource>,
    config: DispatcherConfig,
    record: Mutex<DispatchRecord>,
    slots: Semaphore,
    shutdown_tx: watch::Sender<bool>,
}

impl PollDispatcher {
    pub fn new(source: Arc<dyn WorkSource>, config: DispatcherConfig) -> Result<Self, RelayError> {
        config.validate()?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            source,
            slots: Semaphore::new(config.max_concurrent_tasks),
            config,
            record: Mutex::new(DispatchRecord::default()),
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Polls until [`stop`](Self::stop) is called.
    ///
    /// Stopping never interrupts callbacks already running: the current
    /// batch drains before this returns.
    pub async fn run<F, Fut>(&self, callback: F)
    where
        F: Fn(WorkItem) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs_f64(),
            max_concurrent_tasks = self.config.max_concurrent_tasks,
            "dispatcher started"
        );

        while !self.is_stopped() {
            let report = self.poll_once(&callback).await;
            if !report.outcomes.is_empty() {
                info!(
                    completed = report.completed(),
                    failed = report.failed(),
                    "poll cycle finished"
                );
            }

            if self.is_stopped() {
                break;
            }
            tokio::select! {
                _ = sleep(self.config.poll_interval) => {}
                _ = shutdown_rx.changed() => {}
            }
        }

        info!("dispatcher stopped");
    }

    /// Runs one query-filter-dispatch cycle and waits for its batch to finish.
    pub async fn poll_once<F, Fut>(&self, callback: &F) -> CycleReport
    where
        F: Fn(WorkItem) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let items = match self.source.query_pending().await {
            Ok(items) => items,
            Err(e) => {
                error!(error = %e, "failed to query pending items");
                return CycleReport {
                    query_error: Some(e.to_string()),
                    ..Default::default()
                };
            }
        };

        let discovered = items.len();
        let fresh: Vec<WorkItem> = {
            let record = lock(&self.record);
            let mut seen = HashSet::new();
            items
                .into_iter()
                .filter(|item| !record.is_known(&item.id) && seen.insert(item.id.clone()))
                .collect()
        };
        let skipped = discovered - fresh.len();

        if fresh.is_empty() {
            debug!(discovered, skipped, "no new items");
            return CycleReport {
                discovered,
                skipped,
                ..Default::default()
            };
        }

        info!(count = fresh.len(), skipped, "dispatching new items");
        let outcomes = join_all(fresh.into_iter().map(|item| self.dispatch(item, callback)))
            .await
            .into_iter()
            .flatten()
            .collect();

        CycleReport {
            discovered,
            skipped,
            outcomes,
            query_error: None,
        }
    }

    async fn dispatch<F, Fut>(&self, item: WorkItem, callback: &F) -> Option<(String, ItemOutcome)>
    where
        F: Fn(WorkItem) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        // The semaphore is never closed, so acquire cannot fail.
        let _permit = self.slots.acquire().await.ok()?;

        let id = item.id.clone();
        if !lock(&self.record).begin(&id) {
            debug!(item_id = %id, "already claimed, skipping");
            return None;
        }
        let claim = Claim {
            record: &self.record,
            id: id.clone(),
            resolved: false,
        };

        let result = match self
            .source
            .update_status(&id, WorkStatus::Processing, None)
            .await
        {
            Ok(()) => {
                info!(item_id = %id, "processing started");
                // A panicking callback fails its own item like any other error.
                AssertUnwindSafe(async { callback(item).await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(anyhow::anyhow!(
                            "callback panicked: {}",
                            panic_message(panic.as_ref())
                        ))
                    })
            }
            Err(e) => Err(anyhow::Error::new(e).context("could not mark item as processing")),
        };

        let outcome = match result {
            Ok(()) => {
                claim.resolve(true);
                info!(item_id = %id, "processing completed");
                ItemOutcome::Completed
            }
            Err(e) => {
                let error = format!("{e:#}");
                error!(item_id = %id, error = %error, "processing failed");
                let status_update = match self
                    .source
                    .update_status(&id, WorkStatus::Failed, None)
                    .await
                {
                    Ok(()) => StatusUpdate::Recorded,
                    Err(update_err) => {
                        warn!(item_id = %id, error = %update_err, "could not mark item as failed");
                        StatusUpdate::Failed(update_err.to_string())
                    }
                };
                claim.resolve(self.config.failed_item_policy == FailedItemPolicy::Quarantine);
                ItemOutcome::Failed {
                    error,
                    status_update,
                }
            }
        };

        Some((id, outcome))
    }

    /// Asks [`run`](Self::run) to return after the current cycle. A stopped
    /// dispatcher does not start again.
    pub fn stop(&self) {
        info!("dispatcher stop requested");
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Number of items currently in flight.
    pub fn in_flight(&self) -> usize {
        lock(&self.record).processing.len()
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        lock(&self.record).processing.contains(id)
    }

    pub fn processed_count(&self) -> usize {
        lock(&self.record).processed.len()
    }

    pub fn is_processed(&self, id: &str) -> bool {
        lock(&self.record).processed.contains(id)
    }

    /// Forgets which items were handled, so still-pending ones are dispatched again.
    pub fn reset_processed(&self) {
        let mut record = lock(&self.record);
        let cleared = record.processed.len();
        record.processed.clear();
        info!(cleared, "processed set reset");
    }
}
