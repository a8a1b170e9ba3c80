use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::item::{Priority, WorkItem};

/// What a pipeline run operates on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineInput {
    pub text: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub priority: Priority,
}

impl PipelineInput {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            category: None,
            priority: Priority::default(),
        }
    }

    pub fn with_category(mut self, category: Option<String>) -> Self {
        self.category = category;
        self
    }
}

impl From<&WorkItem> for PipelineInput {
    fn from(item: &WorkItem) -> Self {
        Self {
            text: item.text.clone(),
            category: item.category.clone(),
            priority: item.priority,
        }
    }
}

/// Output of one stage of one pipeline run.
///
/// The executor rebuilds whatever a stage returns into its recorded form
/// (keyed by the stage that ran, with an error on every failure); recorded
/// results are not changed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_name: String,
    pub content: String,
    pub success: bool,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, with = "super::duration_millis", rename = "duration_ms")]
    pub duration: Duration,
    pub created_at: DateTime<Utc>,
}

impl StageResult {
    pub fn success(stage_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            content: content.into(),
            success: true,
            error: None,
            metadata: Map::new(),
            duration: Duration::ZERO,
            created_at: Utc::now(),
        }
    }

    pub fn failure(stage_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            content: String::new(),
            success: false,
            error: Some(error.into()),
            metadata: Map::new(),
            duration: Duration::ZERO,
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Error text for a failed result, with a generic message when the stage gave none.
    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("stage reported failure")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_has_empty_content_and_error() {
        let result = StageResult::failure("analysis", "upstream timeout");
        assert!(!result.success);
        assert!(result.content.is_empty());
        assert_eq!(result.error_message(), "upstream timeout");
    }

    #[test]
    fn metadata_and_duration_survive_json() {
        let result = StageResult::success("research", "three sources found")
            .with_metadata("model", "claude-sonnet-4-5-20250929")
            .with_metadata("tokens", 812)
            .with_duration(Duration::from_millis(1500));

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["duration_ms"], 1500);
        assert_eq!(json["metadata"]["tokens"], 812);

        let parsed: StageResult = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.duration, Duration::from_millis(1500));
        assert_eq!(parsed.metadata["model"], "claude-sonnet-4-5-20250929");
    }

    #[test]
    fn input_from_work_item_keeps_category() {
        let item = WorkItem::new("q-2", "Is the EU launch on track?")
            .with_category("operations")
            .with_priority(Priority::High);
        let input = PipelineInput::from(&item);
        assert_eq!(input.text, "Is the EU launch on track?");
        assert_eq!(input.category.as_deref(), Some("operations"));
        assert_eq!(input.priority, Priority::High);
    }
}
