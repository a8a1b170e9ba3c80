use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::RelayError;
use crate::model::{PipelineInput, StageResult};

/// One stage of the pipeline.
///
/// A stage that cannot produce an answer should prefer returning
/// `Ok(StageResult::failure(..))` over `Err`; the executor treats both the
/// same way, but the former keeps whatever metadata the stage collected.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    async fn ask(
        &self,
        input: &PipelineInput,
        context: &StageContext,
    ) -> Result<StageResult, RelayError>;

    async fn health_check(&self) -> bool {
        true
    }
}

/// Merges the per-stage results of one run into a single answer.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn merge(
        &self,
        input: &PipelineInput,
        results: &[StageResult],
    ) -> Result<String, RelayError>;

    async fn health_check(&self) -> bool {
        true
    }
}

/// Outputs of the stages that already succeeded in the current run.
#[derive(Debug, Clone, Default)]
pub struct StageContext {
    outputs: HashMap<String, String>,
}

impl StageContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Content of stage `name`, or `""` if it has not run or did not succeed.
    pub fn get(&self, name: &str) -> &str {
        self.outputs.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn contains(&self, name: &str) -> bool {
        self.outputs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Adds `result` if it succeeded; failed results are never visible downstream.
    pub(crate) fn record(&mut self, result: &StageResult) {
        if result.success {
            self.outputs
                .insert(result.stage_name.clone(), result.content.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_and_failed_stages_read_as_empty() {
        let mut ctx = StageContext::new();
        ctx.record(&StageResult::success("research", "market is growing"));
        ctx.record(&StageResult::failure("analysis", "timeout"));

        assert_eq!(ctx.get("research"), "market is growing");
        assert_eq!(ctx.get("analysis"), "");
        assert_eq!(ctx.get("never-ran"), "");
        assert!(!ctx.contains("analysis"));
        assert_eq!(ctx.len(), 1);
    }
}
