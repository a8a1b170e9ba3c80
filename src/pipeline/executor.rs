//! Sequential multi-stage execution with synthesis.
//!
//! Stages run one after another; each sees the successful outputs of the
//! stages before it. A failing stage is recorded and the run carries on. As
//! long as one stage succeeded the run produces a synthesis, either from the
//! [`Synthesizer`] or, when that fails, from [`fallback_synthesis`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, timeout};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::agent::{Agent, StageContext, Synthesizer};
use crate::error::RelayError;
use crate::model::{PipelineInput, StageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynthesisSource {
    /// Produced by the synthesizer.
    Merged,
    /// Assembled locally after the synthesizer failed.
    Fallback,
}

/// Everything one pipeline run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub run_id: Uuid,
    pub success: bool,
    pub input: PipelineInput,
    pub stage_results: Vec<StageResult>,
    pub synthesis: Option<String>,
    pub synthesis_source: Option<SynthesisSource>,
    #[serde(with = "duration_secs", rename = "duration_secs")]
    pub duration: Duration,
    pub successful_stages: usize,
    pub total_stages: usize,
    pub errors: Vec<String>,
}

impl PipelineOutcome {
    /// One-line description of why the run failed, if it did.
    pub fn failure_reason(&self) -> Option<String> {
        if self.success {
            return None;
        }
        if self.errors.is_empty() {
            Some("all stages failed".to_string())
        } else {
            Some(format!("all stages failed: {}", self.errors.join("; ")))
        }
    }
}

pub struct PipelineExecutor {
    agents: Vec<Arc<dyn Agent>>,
    synthesizer: Arc<dyn Synthesizer>,
    stage_timeout: Option<Duration>,
}

impl PipelineExecutor {
    pub fn new(agents: Vec<Arc<dyn Agent>>, synthesizer: Arc<dyn Synthesizer>) -> Self {
        Self {
            agents,
            synthesizer,
            stage_timeout: None,
        }
    }

    /// Caps each stage's wall-clock time; an overrun counts as a stage failure.
    pub fn with_stage_timeout(mut self, stage_timeout: Duration) -> Self {
        self.stage_timeout = Some(stage_timeout);
        self
    }

    pub fn agents(&self) -> &[Arc<dyn Agent>] {
        &self.agents
    }

    pub fn synthesizer(&self) -> &Arc<dyn Synthesizer> {
        &self.synthesizer
    }

    /// Health of every stage followed by the synthesizer, in pipeline order.
    pub async fn health_check(&self) -> Vec<(String, bool)> {
        let mut report = Vec::with_capacity(self.agents.len() + 1);
        for agent in &self.agents {
            report.push((agent.name().to_string(), agent.health_check().await));
        }
        report.push(("synthesis".to_string(), self.synthesizer.health_check().await));
        report
    }

    pub async fn run(&self, input: &PipelineInput) -> PipelineOutcome {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let mut errors = Vec::new();
        let mut context = StageContext::new();
        let mut stage_results = Vec::with_capacity(self.agents.len());

        info!(%run_id, stages = self.agents.len(), "pipeline run started");

        for agent in &self.agents {
            let result = self.run_stage(agent.as_ref(), input, &context).await;
            if result.success {
                info!(%run_id, stage = %result.stage_name, "stage succeeded");
            } else {
                let message = result.error_message().to_string();
                warn!(%run_id, stage = %result.stage_name, error = %message, "stage failed");
                errors.push(format!("{}: {message}", result.stage_name));
            }
            context.record(&result);
            stage_results.push(result);
        }

        let successful_stages = stage_results.iter().filter(|r| r.success).count();
        let total_stages = stage_results.len();

        let (synthesis, synthesis_source) = if successful_stages == 0 {
            error!(%run_id, "no stage succeeded, skipping synthesis");
            (None, None)
        } else {
            match self.synthesizer.merge(input, &stage_results).await {
                Ok(text) => (Some(text), Some(SynthesisSource::Merged)),
                Err(e) => {
                    error!(%run_id, error = %e, "synthesis failed, using fallback");
                    errors.push(format!("synthesis: {e}"));
                    (
                        Some(fallback_synthesis(&stage_results)),
                        Some(SynthesisSource::Fallback),
                    )
                }
            }
        };

        let duration = started.elapsed();
        info!(
            %run_id,
            successful_stages,
            total_stages,
            duration_ms = duration.as_millis() as u64,
            "pipeline run finished"
        );

        PipelineOutcome {
            run_id,
            success: successful_stages > 0,
            input: input.clone(),
            stage_results,
            synthesis,
            synthesis_source,
            duration,
            successful_stages,
            total_stages,
            errors,
        }
    }

    async fn run_stage(
        &self,
        agent: &dyn Agent,
        input: &PipelineInput,
        context: &StageContext,
    ) -> StageResult {
        let name = agent.name().to_string();
        let started = Instant::now();

        let outcome = match self.stage_timeout {
            Some(limit) => match timeout(limit, agent.ask(input, context)).await {
                Ok(result) => result,
                Err(_) => Err(RelayError::StageTimeout {
                    stage: name.clone(),
                    timeout: limit,
                }),
            },
            None => agent.ask(input, context).await,
        };

        let reported = match outcome {
            Ok(result) => result,
            Err(e) => StageResult::failure(&name, e.to_string()),
        };
        // Results are keyed by the stage that ran, whatever the agent put there.
        let error = (!reported.success).then(|| reported.error_message().to_string());
        let duration = if reported.duration.is_zero() {
            started.elapsed()
        } else {
            reported.duration
        };
        StageResult {
            stage_name: name,
            error,
            duration,
            ..reported
        }
    }
}

/// Plain-text report of every stage, used when the synthesizer is unavailable.
pub fn fallback_synthesis(results: &[StageResult]) -> String {
    let mut out = String::from("# Pipeline results\n\n");
    for result in results {
        out.push_str(&format!("## {}\n", result.stage_name));
        if result.success {
            out.push_str(&result.content);
        } else {
            out.push_str(&format!("*failed: {}*", result.error_message()));
        }
        out.push_str("\n\n---\n\n");
    }
    out
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behaviour {
        Answer(&'static str),
        Fail(&'static str),
        Error,
        Hang,
        Mislabelled,
    }

    struct StubAgent {
        name: &'static str,
        behaviour: Behaviour,
        seen_context: Mutex<Vec<(String, String)>>,
        reads: &'static [&'static str],
    }

    impl StubAgent {
        fn new(name: &'static str, behaviour: Behaviour) -> Self {
            Self {
                name,
                behaviour,
                seen_context: Mutex::new(Vec::new()),
                reads: &[],
            }
        }

        fn reading(mut self, reads: &'static [&'static str]) -> Self {
            self.reads = reads;
            self
        }
    }

    #[async_trait]
    impl Agent for StubAgent {
        fn name(&self) -> &str {
            self.name
        }

        async fn ask(
            &self,
            _input: &PipelineInput,
            context: &StageContext,
        ) -> Result<StageResult, RelayError> {
            {
                let mut seen = self.seen_context.lock().unwrap();
                for stage in self.reads {
                    seen.push((stage.to_string(), context.get(stage).to_string()));
                }
            }
            match self.behaviour {
                Behaviour::Answer(text) => Ok(StageResult::success(self.name, text)),
                Behaviour::Fail(msg) => Ok(StageResult::failure(self.name, msg)),
                Behaviour::Error => Err(RelayError::Stage {
                    stage: self.name.into(),
                    message: "upstream 500".into(),
                }),
                Behaviour::Mislabelled => Ok(StageResult {
                    error: None,
                    ..StageResult::failure("some-other-stage", "")
                }),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(StageResult::success(self.name, "too late"))
                }
            }
        }
    }

    struct StubSynthesizer {
        fail: bool,
        calls: AtomicUsize,
    }

    impl StubSynthesizer {
        fn ok() -> Self {
            Self {
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Synthesizer for StubSynthesizer {
        async fn merge(
            &self,
            _input: &PipelineInput,
            results: &[StageResult],
        ) -> Result<String, RelayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RelayError::Synthesis("model unavailable".into()));
            }
            let merged: Vec<&str> = results
                .iter()
                .filter(|r| r.success)
                .map(|r| r.content.as_str())
                .collect();
            Ok(merged.join(" + "))
        }
    }

    fn input() -> PipelineInput {
        PipelineInput::new("Should we open a Berlin office?")
    }

    #[tokio::test]
    async fn partial_failure_falls_back_with_every_stage_listed() {
        let synthesizer = Arc::new(StubSynthesizer::failing());
        let executor = PipelineExecutor::new(
            vec![
                Arc::new(StubAgent::new("research", Behaviour::Answer("rents are rising"))),
                Arc::new(StubAgent::new("analysis", Behaviour::Error)),
                Arc::new(StubAgent::new("planning", Behaviour::Answer("hire locally"))),
            ],
            synthesizer.clone(),
        );

        let outcome = executor.run(&input()).await;

        assert!(outcome.success);
        assert_eq!(outcome.successful_stages, 2);
        assert_eq!(outcome.total_stages, 3);
        assert_eq!(outcome.synthesis_source, Some(SynthesisSource::Fallback));
        let text = outcome.synthesis.unwrap();
        assert!(text.contains("rents are rising"));
        assert!(text.contains("hire locally"));
        assert!(text.contains("## analysis\n*failed: Stage 'analysis' failed: upstream 500*"));
        assert!(text.find("## research").unwrap() < text.find("## analysis").unwrap());
        assert!(text.find("## analysis").unwrap() < text.find("## planning").unwrap());
        assert_eq!(synthesizer.calls.load(Ordering::SeqCst), 1);
        assert!(outcome.errors.iter().any(|e| e.starts_with("synthesis:")));
        assert!(outcome.errors.iter().any(|e| e.starts_with("analysis: ")));
    }

    #[tokio::test]
    async fn total_failure_skips_synthesis() {
        let synthesizer = Arc::new(StubSynthesizer::ok());
        let executor = PipelineExecutor::new(
            vec![
                Arc::new(StubAgent::new("research", Behaviour::Error)),
                Arc::new(StubAgent::new("analysis", Behaviour::Error)),
                Arc::new(StubAgent::new("planning", Behaviour::Error)),
            ],
            synthesizer.clone(),
        );

        let outcome = executor.run(&input()).await;

        assert!(!outcome.success);
        assert_eq!(outcome.successful_stages, 0);
        assert!(outcome.synthesis.is_none());
        assert!(outcome.synthesis_source.is_none());
        assert_eq!(synthesizer.calls.load(Ordering::SeqCst), 0);
        assert!(outcome.failure_reason().unwrap().starts_with("all stages failed"));
        assert_eq!(outcome.stage_results.len(), 3);
        assert!(outcome.stage_results.iter().all(|r| r.error.is_some()));
    }

    #[tokio::test]
    async fn merged_synthesis_is_used_when_available() {
        let executor = PipelineExecutor::new(
            vec![
                Arc::new(StubAgent::new("research", Behaviour::Answer("a"))),
                Arc::new(StubAgent::new("analysis", Behaviour::Answer("b"))),
            ],
            Arc::new(StubSynthesizer::ok()),
        );

        let outcome = executor.run(&input()).await;
        assert_eq!(outcome.synthesis.as_deref(), Some("a + b"));
        assert_eq!(outcome.synthesis_source, Some(SynthesisSource::Merged));
        assert!(outcome.errors.is_empty());
        assert!(outcome.failure_reason().is_none());
    }

    #[tokio::test]
    async fn later_stages_see_only_successful_earlier_output() {
        let planner = Arc::new(
            StubAgent::new("planning", Behaviour::Answer("plan"))
                .reading(&["research", "analysis"]),
        );
        let executor = PipelineExecutor::new(
            vec![
                Arc::new(StubAgent::new("research", Behaviour::Answer("facts"))),
                Arc::new(StubAgent::new("analysis", Behaviour::Error)),
                planner.clone(),
            ],
            Arc::new(StubSynthesizer::ok()),
        );

        executor.run(&input()).await;

        let seen = planner.seen_context.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                ("research".to_string(), "facts".to_string()),
                ("analysis".to_string(), String::new()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_stage_times_out_and_run_continues() {
        let executor = PipelineExecutor::new(
            vec![
                Arc::new(StubAgent::new("research", Behaviour::Hang)),
                Arc::new(StubAgent::new("analysis", Behaviour::Answer("done"))),
            ],
            Arc::new(StubSynthesizer::ok()),
        )
        .with_stage_timeout(Duration::from_secs(30));

        let outcome = executor.run(&input()).await;

        assert!(outcome.success);
        let research = &outcome.stage_results[0];
        assert!(!research.success);
        assert!(research.error_message().contains("timed out"));
        assert!(research.duration >= Duration::from_secs(30));
        assert_eq!(outcome.synthesis.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn unsuccessful_result_is_recorded_not_raised() {
        let executor = PipelineExecutor::new(
            vec![
                Arc::new(StubAgent::new("research", Behaviour::Fail("quota exceeded"))),
                Arc::new(StubAgent::new("analysis", Behaviour::Answer("ok"))),
            ],
            Arc::new(StubSynthesizer::ok()),
        );

        let outcome = executor.run(&input()).await;
        assert!(outcome.success);
        assert_eq!(outcome.stage_results[0].error_message(), "quota exceeded");
        assert_eq!(outcome.errors, vec!["research: quota exceeded".to_string()]);
    }

    #[tokio::test]
    async fn recorded_results_are_keyed_and_complete() {
        let executor = PipelineExecutor::new(
            vec![
                Arc::new(StubAgent::new("research", Behaviour::Mislabelled)),
                Arc::new(StubAgent::new("analysis", Behaviour::Answer("ok"))),
            ],
            Arc::new(StubSynthesizer::ok()),
        );

        let outcome = executor.run(&input()).await;
        let research = &outcome.stage_results[0];
        assert_eq!(research.stage_name, "research");
        assert_eq!(research.error.as_deref(), Some("stage reported failure"));
        assert!(outcome.stage_results[1].error.is_none());
    }

    #[test]
    fn fallback_is_deterministic() {
        let results = vec![
            StageResult::success("research", "facts"),
            StageResult::failure("analysis", "boom"),
        ];
        assert_eq!(
            fallback_synthesis(&results),
            "# Pipeline results\n\n## research\nfacts\n\n---\n\n## analysis\n*failed: boom*\n\n---\n\n"
        );
    }

    #[tokio::test]
    async fn outcome_serialises_for_the_results_file() {
        let executor = PipelineExecutor::new(
            vec![Arc::new(StubAgent::new("research", Behaviour::Answer("facts")))],
            Arc::new(StubSynthesizer::ok()),
        );
        let outcome = executor.run(&input()).await;

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["synthesis_source"], "merged");
        assert_eq!(json["stage_results"][0]["stage_name"], "research");
        assert!(json["duration_secs"].is_number());
    }

    #[tokio::test]
    async fn health_check_lists_every_component() {
        let executor = PipelineExecutor::new(
            vec![Arc::new(StubAgent::new("research", Behaviour::Answer("x")))],
            Arc::new(StubSynthesizer::ok()),
        );
        assert_eq!(
            executor.health_check().await,
            vec![("research".to_string(), true), ("synthesis".to_string(), true)]
        );
    }
}
