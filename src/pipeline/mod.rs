//! Running a work item through its stages and merging the answers.

mod agent;
mod executor;

pub use agent::{Agent, StageContext, Synthesizer};
pub use executor::{PipelineExecutor, PipelineOutcome, SynthesisSource, fallback_synthesis};
