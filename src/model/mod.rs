pub(crate) mod duration_millis;
mod item;
mod stage;

pub use item::{Priority, WorkItem, WorkStatus};
pub use stage::{PipelineInput, StageResult};
