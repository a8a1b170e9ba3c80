//! Discovering pending work and handing it out exactly once per process.

mod dispatcher;
mod file_source;
mod source;

pub use dispatcher::{
    CycleReport, DispatcherConfig, FailedItemPolicy, ItemOutcome, PollDispatcher, StatusUpdate,
};
pub use file_source::{FileSource, QueueCounts, QueueRecord};
pub use source::{ResilientSource, WorkSource};
