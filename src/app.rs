//! Wires the queue, the pipeline and the dispatcher together.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::anthropic::{AnthropicAgent, AnthropicClient, AnthropicSynthesizer, MessageSender};
use crate::config::RelayConfig;
use crate::dispatch::{FileSource, PollDispatcher, ResilientSource, WorkSource};
use crate::model::{PipelineInput, WorkItem, WorkStatus};
use crate::pipeline::{Agent, PipelineExecutor, PipelineOutcome};
use crate::resilience::RateLimiterRegistry;

pub struct Application {
    config: RelayConfig,
    source: Arc<dyn WorkSource>,
    executor: PipelineExecutor,
}

impl Application {
    /// Builds the application against the real API. Requires an API key.
    pub fn new(config: RelayConfig) -> Result<Self> {
        let client = AnthropicClient::new(config.require_api_key()?)?;
        Self::with_client(config, client)
    }

    pub fn with_client<C: MessageSender + 'static>(config: RelayConfig, client: C) -> Result<Self> {
        config.validate()?;
        let registry = RateLimiterRegistry::from_config(&config.rate_limits)?;
        let client = Arc::new(client);

        let agents = config
            .stages
            .iter()
            .map(|stage| -> Result<Arc<dyn Agent>> {
                let agent: Arc<dyn Agent> = Arc::new(AnthropicAgent::new(
                    stage,
                    Arc::clone(&client),
                    registry.limiter(&stage.rate_limit)?,
                    config.retry.clone(),
                ));
                Ok(agent)
            })
            .collect::<Result<Vec<_>>>()?;
        let synthesizer = Arc::new(AnthropicSynthesizer::new(
            &config.synthesis,
            Arc::clone(&client),
            registry.limiter(&config.synthesis.rate_limit)?,
            config.retry.clone(),
        ));
        let mut executor = PipelineExecutor::new(agents, synthesizer);
        if let Some(stage_timeout) = config.pipeline.stage_timeout() {
            executor = executor.with_stage_timeout(stage_timeout);
        }

        let source: Arc<dyn WorkSource> = Arc::new(ResilientSource::new(
            FileSource::new(config.queue_path.clone()),
            registry.limiter(&config.pipeline.queue_rate_limit)?,
            config.retry.clone(),
        ));

        Ok(Self {
            config,
            source,
            executor,
        })
    }

    /// Queue first, then each stage and the synthesizer.
    pub async fn health_check(&self) -> Vec<(String, bool)> {
        let mut report = vec![("queue".to_string(), self.source.health_check().await)];
        report.extend(self.executor.health_check().await);
        report
    }

    pub async fn ask(&self, input: &PipelineInput) -> PipelineOutcome {
        self.executor.run(input).await
    }

    /// Dispatcher callback: runs the pipeline, stores the outcome and marks
    /// the item completed. Any error leaves marking it failed to the dispatcher.
    pub async fn process(&self, item: WorkItem) -> Result<()> {
        let outcome = self.executor.run(&PipelineInput::from(&item)).await;
        if let Some(reason) = outcome.failure_reason() {
            bail!(reason);
        }
        if !outcome.errors.is_empty() {
            warn!(item_id = %item.id, errors = ?outcome.errors, "completed with errors");
        }

        let path = self
            .write_result(&item.id, &outcome)
            .await
            .with_context(|| format!("could not store result for {}", item.id))?;
        let result_ref = path.display().to_string();
        self.source
            .update_status(&item.id, WorkStatus::Completed, Some(&result_ref))
            .await?;
        info!(item_id = %item.id, result = %result_ref, "result stored");
        Ok(())
    }

    async fn write_result(&self, id: &str, outcome: &PipelineOutcome) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.config.results_dir).await?;
        let path = self
            .config
            .results_dir
            .join(format!("{}.json", file_stem(id)));
        tokio::fs::write(&path, serde_json::to_vec_pretty(outcome)?).await?;
        Ok(path)
    }

    /// Runs until Ctrl-C or SIGTERM.
    pub async fn watch(&self) -> Result<()> {
        self.watch_until(shutdown_signal()).await
    }

    /// Health-checks everything, then dispatches until `shutdown` resolves.
    /// Items already in flight finish before this returns.
    pub async fn watch_until(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let unhealthy: Vec<String> = self
            .health_check()
            .await
            .into_iter()
            .filter(|(_, ok)| !ok)
            .map(|(name, _)| name)
            .collect();
        if !unhealthy.is_empty() {
            bail!("health check failed: {}", unhealthy.join(", "));
        }
        info!("all components healthy");

        let dispatcher = PollDispatcher::new(
            Arc::clone(&self.source),
            self.config.dispatcher.to_dispatcher_config(),
        )?;
        tokio::join!(dispatcher.run(|item| self.process(item)), async {
            shutdown.await;
            dispatcher.stop();
        });
        Ok(())
    }
}

/// Ids come from the queue file; keep them from escaping the results directory.
/// A rewritten id gets a stable suffix derived from the raw id, so `a/b` and
/// `a_b` never share a results file.
fn file_stem(id: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !id.is_empty() && id.chars().all(safe) {
        return id.to_string();
    }
    let cleaned: String = id.chars().map(|c| if safe(c) { c } else { '_' }).collect();
    let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, id.as_bytes()).simple().to_string();
    format!("{cleaned}-{}", &digest[..8])
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "could not listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::QueueRecord;
    use crate::resilience::RetryPolicy;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn server_replying(status: u16) -> MockServer {
        let server = MockServer::start().await;
        let template = if status == 200 {
            ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_1",
                "content": [{"type": "text", "text": "Hire one engineer now."}],
                "model": "claude-test",
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 10, "output_tokens": 5}
            }))
        } else {
            ResponseTemplate::new(status).set_body_string("bad request")
        };
        Mock::given(method("POST"))
            .respond_with(template)
            .mount(&server)
            .await;
        server
    }

    fn app_for(server: &MockServer, dir: &tempfile::TempDir) -> Application {
        let mut config = RelayConfig::default();
        config.queue_path = dir.path().join("queue.json");
        config.results_dir = dir.path().join("results");
        config.dispatcher.poll_interval_secs = 0.05;
        config.retry = RetryPolicy::new(1, Duration::from_millis(10), 2.0).unwrap();
        let client =
            AnthropicClient::with_base_url("test-key", format!("{}/v1/messages", server.uri()))
                .unwrap();
        Application::with_client(config, client).unwrap()
    }

    async fn records(dir: &tempfile::TempDir) -> Vec<QueueRecord> {
        FileSource::new(dir.path().join("queue.json"))
            .records()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn processed_item_is_stored_and_completed() {
        let server = server_replying(200).await;
        let dir = tempfile::tempdir().unwrap();
        let app = app_for(&server, &dir);
        let queue = FileSource::new(dir.path().join("queue.json"));
        queue
            .enqueue(WorkItem::new("q-1", "Should we hire?"))
            .await
            .unwrap();

        app.process(WorkItem::new("q-1", "Should we hire?"))
            .await
            .unwrap();

        let stored = dir.path().join("results").join("q-1.json");
        let outcome: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&stored).unwrap()).unwrap();
        assert_eq!(outcome["success"], true);
        assert_eq!(outcome["successful_stages"], 3);
        assert_eq!(outcome["synthesis"], "Hire one engineer now.");

        let record = &records(&dir).await[0];
        assert_eq!(record.item.status, WorkStatus::Completed);
        assert_eq!(
            record.result_ref.as_deref(),
            Some(stored.display().to_string().as_str())
        );
    }

    #[tokio::test]
    async fn total_failure_is_an_error() {
        let server = server_replying(400).await;
        let dir = tempfile::tempdir().unwrap();
        let app = app_for(&server, &dir);

        let err = app
            .process(WorkItem::new("q-1", "Should we hire?"))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("all stages failed"));
        assert!(!dir.path().join("results").exists());
    }

    #[tokio::test]
    async fn watch_processes_the_queue_and_stops() {
        let server = server_replying(200).await;
        let dir = tempfile::tempdir().unwrap();
        let app = app_for(&server, &dir);
        let queue = FileSource::new(dir.path().join("queue.json"));
        queue.enqueue(WorkItem::new("a", "first")).await.unwrap();
        queue.enqueue(WorkItem::new("b", "second")).await.unwrap();

        let drained = async {
            loop {
                let counts = queue.counts().await.unwrap();
                if counts.completed == 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(10), app.watch_until(drained))
            .await
            .unwrap()
            .unwrap();

        assert!(dir.path().join("results").join("a.json").exists());
        assert!(dir.path().join("results").join("b.json").exists());
    }

    #[tokio::test]
    async fn watch_refuses_to_start_when_unhealthy() {
        let server = server_replying(401).await;
        let dir = tempfile::tempdir().unwrap();
        let app = app_for(&server, &dir);

        let err = app.watch_until(async {}).await.unwrap_err();
        assert!(err.to_string().contains("research"));
        assert!(err.to_string().contains("synthesis"));
    }

    #[test]
    fn new_requires_an_api_key() {
        assert!(Application::new(RelayConfig::default()).is_err());
    }

    #[test]
    fn file_stem_strips_path_separators() {
        assert_eq!(file_stem("q-1"), "q-1");
        let escaped = file_stem("../etc/passwd");
        assert!(escaped.starts_with("___etc_passwd-"));
        assert!(!escaped.contains('/'));
        assert_eq!(escaped, file_stem("../etc/passwd"));
    }

    #[test]
    fn rewritten_ids_do_not_collide() {
        assert_eq!(file_stem("a_b"), "a_b");
        assert_ne!(file_stem("a/b"), file_stem("a_b"));
        assert_ne!(file_stem("a/b"), file_stem("a.b"));
        assert!(!file_stem("").is_empty());
    }
}
