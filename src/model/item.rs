use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a work item as recorded by the external source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkStatus::Pending => write!(f, "pending"),
            WorkStatus::Processing => write!(f, "processing"),
            WorkStatus::Completed => write!(f, "completed"),
            WorkStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Ordering hint used by sources when listing pending work. Declaration
/// order is the sort order: `High` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// A unit of work pulled from the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub text: String,
    pub status: WorkStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// A freshly queued, pending item.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            status: WorkStatus::Pending,
            priority: Priority::default(),
            category: None,
            created_at: Some(Utc::now()),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_item_is_pending_with_medium_priority() {
        let item = WorkItem::new("q-1", "How should we price the new tier?");
        assert_eq!(item.status, WorkStatus::Pending);
        assert_eq!(item.priority, Priority::Medium);
        assert!(item.category.is_none());
        assert!(item.created_at.is_some());
    }

    #[test]
    fn priority_sorts_high_first() {
        let mut priorities = vec![Priority::Low, Priority::High, Priority::Medium];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![Priority::High, Priority::Medium, Priority::Low]
        );
    }

    #[test]
    fn status_uses_lowercase_names() {
        assert_eq!(
            serde_json::to_string(&WorkStatus::Processing).unwrap(),
            r#""processing""#
        );
        assert_eq!(WorkStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn item_deserializes_with_optional_fields_missing() {
        let json = r#"{"id": "q-7", "text": "Summarise churn drivers", "status": "pending"}"#;
        let item: WorkItem = serde_json::from_str(json).unwrap();
        assert_eq!(item.id, "q-7");
        assert_eq!(item.priority, Priority::Medium);
        assert_eq!(item.created_at, None);
    }
}
