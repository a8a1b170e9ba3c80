//! Configuration loaded from `relay.toml`.
//!
//! Every field has a default, so a missing file or a partial one is fine.
//! `ANTHROPIC_API_KEY` in the environment takes precedence over the file.
//! [`RelayConfig::validate`] runs at startup and rejects anything the
//! runtime would otherwise trip over later.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::dispatch::{DispatcherConfig, FailedItemPolicy};
use crate::error::RelayError;
use crate::resilience::RetryPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "relay.toml";
pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub api_key: String,
    /// Default tracing filter; `RUST_LOG` overrides it.
    pub log_level: String,
    /// JSON file backing the work queue.
    pub queue_path: PathBuf,
    /// Where each completed run is written as `<item id>.json`.
    pub results_dir: PathBuf,
    pub dispatcher: DispatcherSettings,
    pub retry: RetryPolicy,
    /// Named request budgets. Stages, the synthesizer and the queue each
    /// refer to one of these by name.
    pub rate_limits: BTreeMap<String, RateLimitConfig>,
    pub pipeline: PipelineSettings,
    pub stages: Vec<StageConfig>,
    pub synthesis: SynthesisConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            log_level: "info".to_string(),
            queue_path: PathBuf::from("queue.json"),
            results_dir: PathBuf::from("results"),
            dispatcher: DispatcherSettings::default(),
            retry: RetryPolicy::default(),
            rate_limits: default_rate_limits(),
            pipeline: PipelineSettings::default(),
            stages: default_stages(),
            synthesis: SynthesisConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    pub poll_interval_secs: f64,
    pub max_concurrent_tasks: usize,
    pub failed_item_policy: FailedItemPolicy,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30.0,
            max_concurrent_tasks: 5,
            failed_item_policy: FailedItemPolicy::default(),
        }
    }
}

impl DispatcherSettings {
    pub fn to_dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            poll_interval: secs(self.poll_interval_secs),
            max_concurrent_tasks: self.max_concurrent_tasks,
            failed_item_policy: self.failed_item_policy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_secs: f64,
}

impl RateLimitConfig {
    /// The window as a `Duration`; negative or non-finite values become zero
    /// and are rejected when the limiter is built.
    pub fn window(&self) -> Duration {
        secs(self.window_secs)
    }
}

fn default_rate_limits() -> BTreeMap<String, RateLimitConfig> {
    BTreeMap::from([
        (
            "anthropic".to_string(),
            RateLimitConfig {
                max_requests: 50,
                window_secs: 60.0,
            },
        ),
        (
            "queue".to_string(),
            RateLimitConfig {
                max_requests: 3,
                window_secs: 1.0,
            },
        ),
    ])
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Per-stage time cap. Unset means stages may run as long as they like.
    pub stage_timeout_secs: Option<f64>,
    /// Rate limit applied to queue reads and writes.
    pub queue_rate_limit: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            stage_timeout_secs: Some(300.0),
            queue_rate_limit: "queue".to_string(),
        }
    }
}

impl PipelineSettings {
    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_secs.map(secs)
    }
}

/// One model-backed pipeline stage.
#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    pub name: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_stage_max_tokens")]
    pub max_tokens: u32,
    /// Role prompt. `{question}` and `{category}` are substituted.
    pub instructions: String,
    /// Earlier stages whose output is appended to the prompt.
    #[serde(default)]
    pub context_from: Vec<String>,
    #[serde(default = "default_model_rate_limit")]
    pub rate_limit: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub model: String,
    pub max_tokens: u32,
    pub rate_limit: String,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: 5000,
            rate_limit: default_model_rate_limit(),
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_stage_max_tokens() -> u32 {
    4000
}

fn default_model_rate_limit() -> String {
    "anthropic".to_string()
}

fn default_stages() -> Vec<StageConfig> {
    let stage = |name: &str, instructions: &str, context_from: &[&str]| StageConfig {
        name: name.to_string(),
        model: default_model(),
        max_tokens: default_stage_max_tokens(),
        instructions: instructions.to_string(),
        context_from: context_from.iter().map(|s| s.to_string()).collect(),
        rate_limit: default_model_rate_limit(),
    };
    vec![
        stage(
            "research",
            "You are a research specialist in {category}. Gather the facts, figures, \
             recent developments and open uncertainties relevant to the question below. \
             Cite where each fact comes from.\n\nQuestion: {question}",
            &[],
        ),
        stage(
            "analysis",
            "You are a strategy analyst in {category}. Using the research provided, weigh \
             the options, their risks and their expected payoff. State which option you \
             favour and why.\n\nQuestion: {question}",
            &["research"],
        ),
        stage(
            "planning",
            "You are an execution lead in {category}. Turn the research and analysis into a \
             step-by-step plan with owners, timeline, resources and risk mitigations. Point \
             out any gaps or mistakes in the earlier work.\n\nQuestion: {question}",
            &["research", "analysis"],
        ),
    ]
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl RelayConfig {
    /// Loads `path`, falling back to defaults when the file does not exist,
    /// then applies the environment override for the API key.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RelayError> {
        let path = path.as_ref();
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<RelayConfig>(&contents)?
        } else {
            Self::default()
        };
        Ok(config.with_api_key_override(std::env::var(API_KEY_ENV).ok()))
    }

    /// Replaces the API key with `key` when it is present and non-empty.
    pub fn with_api_key_override(mut self, key: Option<String>) -> Self {
        if let Some(key) = key
            && !key.is_empty()
        {
            self.api_key = key;
        }
        self
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        self.dispatcher.to_dispatcher_config().validate()?;
        self.retry.validate()?;

        for (name, limit) in &self.rate_limits {
            if limit.max_requests == 0 {
                return Err(RelayError::config(format!(
                    "rate limit '{name}': max_requests must be at least 1"
                )));
            }
            if limit.window().is_zero() {
                return Err(RelayError::config(format!(
                    "rate limit '{name}': window_secs must be greater than zero"
                )));
            }
        }

        if let Some(timeout) = self.pipeline.stage_timeout()
            && timeout.is_zero()
        {
            return Err(RelayError::config(
                "pipeline: stage_timeout_secs must be greater than zero",
            ));
        }
        self.require_rate_limit("pipeline.queue_rate_limit", &self.pipeline.queue_rate_limit)?;

        if self.stages.is_empty() {
            return Err(RelayError::config("at least one [[stages]] entry is required"));
        }
        let mut earlier = HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(RelayError::config("stage names must not be empty"));
            }
            if stage.name == "synthesis" {
                return Err(RelayError::config("'synthesis' is reserved for the merge step"));
            }
            for source in &stage.context_from {
                if !earlier.contains(source.as_str()) {
                    return Err(RelayError::config(format!(
                        "stage '{}': context_from '{source}' is not an earlier stage",
                        stage.name
                    )));
                }
            }
            if !earlier.insert(stage.name.as_str()) {
                return Err(RelayError::config(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
            self.require_rate_limit(&format!("stage '{}'", stage.name), &stage.rate_limit)?;
        }
        self.require_rate_limit("synthesis", &self.synthesis.rate_limit)?;

        Ok(())
    }

    /// Fails unless an API key is configured. Only commands that call the
    /// model need one.
    pub fn require_api_key(&self) -> Result<&str, RelayError> {
        if self.api_key.is_empty() {
            return Err(RelayError::config(format!(
                "no API key: set {API_KEY_ENV} or api_key in the config file"
            )));
        }
        Ok(&self.api_key)
    }

    fn require_rate_limit(&self, owner: &str, name: &str) -> Result<(), RelayError> {
        if self.rate_limits.contains_key(name) {
            Ok(())
        } else {
            Err(RelayError::config(format!(
                "{owner}: unknown rate limit '{name}'"
            )))
        }
    }
}
