//! Pipeline stages and synthesis backed by the messages API.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error};

use super::client::MessageSender;
use super::error::AnthropicError;
use super::types::{MessagesRequest, MessagesResponse};
use crate::config::{StageConfig, SynthesisConfig};
use crate::error::RelayError;
use crate::model::{PipelineInput, StageResult};
use crate::pipeline::{Agent, StageContext, Synthesizer};
use crate::resilience::{RateLimiter, RetryPolicy, retry};

const NO_OUTPUT: &str = "(no output)";
const DEFAULT_CATEGORY: &str = "general";

/// Throttled, retried call shared by agents and the synthesizer.
async fn call<C: MessageSender>(
    client: &C,
    limiter: &RateLimiter,
    policy: &RetryPolicy,
    request: &MessagesRequest,
) -> Result<MessagesResponse, AnthropicError> {
    retry(policy, move || async move {
        limiter.acquire().await;
        client.send_message(request).await
    })
    .await
}

fn render(template: &str, input: &PipelineInput) -> String {
    template
        .replace("{question}", &input.text)
        .replace(
            "{category}",
            input.category.as_deref().unwrap_or(DEFAULT_CATEGORY),
        )
}

/// A stage that asks the model to play one role.
pub struct AnthropicAgent<C> {
    name: String,
    model: String,
    max_tokens: u32,
    instructions: String,
    context_from: Vec<String>,
    client: Arc<C>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

impl<C: MessageSender> AnthropicAgent<C> {
    pub fn new(
        stage: &StageConfig,
        client: Arc<C>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            name: stage.name.clone(),
            model: stage.model.clone(),
            max_tokens: stage.max_tokens,
            instructions: stage.instructions.clone(),
            context_from: stage.context_from.clone(),
            client,
            limiter,
            retry,
        }
    }

    /// Role instructions followed by the outputs this stage reads.
    pub fn build_prompt(&self, input: &PipelineInput, context: &StageContext) -> String {
        let mut prompt = render(&self.instructions, input);
        for stage in &self.context_from {
            let output = context.get(stage);
            prompt.push_str(&format!(
                "\n\n## Output from {stage}\n{}",
                if output.is_empty() { NO_OUTPUT } else { output }
            ));
        }
        prompt
    }
}

#[async_trait]
impl<C: MessageSender + 'static> Agent for AnthropicAgent<C> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ask(
        &self,
        input: &PipelineInput,
        context: &StageContext,
    ) -> Result<StageResult, RelayError> {
        let request = MessagesRequest::single(
            &self.model,
            self.max_tokens,
            self.build_prompt(input, context),
        );
        let started = Instant::now();

        let response =
            match call(self.client.as_ref(), &self.limiter, &self.retry, &request).await {
                Ok(response) => response,
                Err(e) => {
                    error!(stage = %self.name, error = %e, "model call failed");
                    return Ok(StageResult::failure(&self.name, e.to_string())
                        .with_duration(started.elapsed()));
                }
            };

        let text = response.text();
        if text.trim().is_empty() {
            return Ok(
                StageResult::failure(&self.name, AnthropicError::EmptyResponse.to_string())
                    .with_duration(started.elapsed()),
            );
        }
        debug!(
            stage = %self.name,
            output_tokens = response.usage.output_tokens,
            "model call succeeded"
        );
        Ok(StageResult::success(&self.name, text)
            .with_metadata("model", response.model)
            .with_metadata("input_tokens", response.usage.input_tokens)
            .with_metadata("output_tokens", response.usage.output_tokens)
            .with_metadata("tokens", response.usage.total())
            .with_duration(started.elapsed()))
    }

    /// One-token request; any successful reply counts as healthy.
    async fn health_check(&self) -> bool {
        let request = MessagesRequest::single(&self.model, 1, "ping");
        self.limiter.acquire().await;
        match self.client.send_message(&request).await {
            Ok(_) => true,
            Err(e) => {
                error!(stage = %self.name, error = %e, "health check failed");
                false
            }
        }
    }
}

/// Merges stage outputs into one recommendation.
pub struct AnthropicSynthesizer<C> {
    model: String,
    max_tokens: u32,
    client: Arc<C>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

impl<C: MessageSender> AnthropicSynthesizer<C> {
    pub fn new(
        config: &SynthesisConfig,
        client: Arc<C>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            client,
            limiter,
            retry,
        }
    }

    pub fn build_prompt(input: &PipelineInput, results: &[StageResult]) -> String {
        let mut prompt = format!(
            "Several specialists answered the question below, each from their own angle.\n\n\
             Question: {}\nCategory: {}\n\n---\n\n",
            input.text,
            input.category.as_deref().unwrap_or(DEFAULT_CATEGORY),
        );
        for result in results {
            let body = if result.success && !result.content.is_empty() {
                result.content.as_str()
            } else {
                NO_OUTPUT
            };
            prompt.push_str(&format!("### {}\n{body}\n\n---\n\n", result.stage_name));
        }
        prompt.push_str(
            "Combine these into one consistent answer. Separate where the specialists \
             agree from where they conflict, pick the best-supported position on each \
             conflict and say why, fill any gaps, and finish with a single actionable \
             recommendation and prioritised next steps.",
        );
        prompt
    }
}

#[async_trait]
impl<C: MessageSender + 'static> Synthesizer for AnthropicSynthesizer<C> {
    async fn merge(
        &self,
        input: &PipelineInput,
        results: &[StageResult],
    ) -> Result<String, RelayError> {
        let request = MessagesRequest::single(
            &self.model,
            self.max_tokens,
            Self::build_prompt(input, results),
        );
        let response = call(self.client.as_ref(), &self.limiter, &self.retry, &request).await?;
        let text = response.text();
        if text.trim().is_empty() {
            return Err(AnthropicError::EmptyResponse.into());
        }
        Ok(text)
    }

    async fn health_check(&self) -> bool {
        let request = MessagesRequest::single(&self.model, 1, "ping");
        self.limiter.acquire().await;
        self.client.send_message(&request).await.is_ok()
    }
}
