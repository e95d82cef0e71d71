//! Core data models used throughout Task Harness.
//!
//! [`Task`] and [`Project`] mirror records owned by the external task
//! source. [`EnrichedTask`] pairs a task with its latest analysis and vector
//! bookkeeping; it is replaced wholesale every time the task is processed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::fingerprint::Fingerprint;

/// Task priority, 0 (unset) through 4 (urgent).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(into = "u8", try_from = "u8")]
pub enum Priority {
    #[default]
    None = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    Urgent = 4,
}

impl Priority {
    /// Map a raw source value into range, clamping anything outside 0–4.
    pub fn from_source(raw: i64) -> Self {
        match raw {
            i64::MIN..=0 => Self::None,
            1 => Self::Low,
            2 => Self::Medium,
            3 => Self::High,
            _ => Self::Urgent,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Human-readable level used in derived metadata.
    pub fn level(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p.as_u8()
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Low),
            2 => Ok(Self::Medium),
            3 => Ok(Self::High),
            4 => Ok(Self::Urgent),
            other => Err(format!("priority out of range: {other}")),
        }
    }
}

/// Due date of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Due {
    /// Calendar date, `YYYY-MM-DD`.
    pub date: String,
    /// Full timestamp when the due date carries a time of day.
    #[serde(default)]
    pub datetime: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    /// Recurrence rule as written by the user (e.g. `"every monday"`).
    /// Present only for recurring due dates.
    #[serde(default)]
    pub recurrence: Option<String>,
}

impl Due {
    pub fn is_recurring(&self) -> bool {
        self.recurrence.is_some()
    }
}

/// A task mirrored from the task source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub content: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub due: Option<Due>,
    #[serde(default)]
    pub is_completed: bool,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub section_id: Option<String>,
    #[serde(default)]
    pub assignee_id: Option<String>,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub comment_count: i64,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Minimal task with the given id, project, and content.
    pub fn new(
        id: impl Into<String>,
        project_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            content: content.into(),
            description: String::new(),
            priority: Priority::None,
            due: None,
            is_completed: false,
            labels: BTreeSet::new(),
            parent_id: None,
            section_id: None,
            assignee_id: None,
            order: 0,
            comment_count: 0,
            url: None,
            created_at: None,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self)
    }

    /// Text handed to the embedding model.
    pub fn embedding_text(&self) -> String {
        format!("Task: {}\nDescription: {}", self.content, self.description)
    }

    /// True when neither content nor description carries any text.
    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty() && self.description.trim().is_empty()
    }
}

/// A project mirrored from the task source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub is_shared: bool,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(default)]
    pub is_inbox_project: bool,
    #[serde(default)]
    pub is_team_inbox: bool,
    #[serde(default = "default_view_style")]
    pub view_style: String,
    #[serde(default)]
    pub url: Option<String>,
}

fn default_view_style() -> String {
    "list".to_string()
}

impl Project {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parent_id: None,
            order: 0,
            is_shared: false,
            is_favorite: false,
            is_inbox_project: false,
            is_team_inbox: false,
            view_style: default_view_style(),
            url: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        if self.is_inbox_project {
            "inbox"
        } else if self.is_team_inbox {
            "team_inbox"
        } else if self.is_shared {
            "shared"
        } else {
            "personal"
        }
    }
}

/// Structured analysis produced by the enrichment service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub complexity: String,
    #[serde(default)]
    pub themes: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub next_actions: Vec<String>,
}

/// Bookkeeping for the single live vector of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub index_document_id: String,
    pub embedding_model: String,
    pub last_updated: DateTime<Utc>,
    pub fingerprint: Fingerprint,
}

/// Deterministic metadata derived from a task and its project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub project_name: Option<String>,
    pub project_kind: Option<String>,
    pub task_kind: String,
    pub priority_level: String,
    pub has_due_date: bool,
    pub is_recurring: bool,
    pub has_description: bool,
    pub is_subtask: bool,
}

impl TaskMetadata {
    pub fn derive(task: &Task, project: Option<&Project>) -> Self {
        let is_recurring = task.due.as_ref().is_some_and(Due::is_recurring);
        let task_kind = if task.parent_id.is_some() {
            "subtask"
        } else if is_recurring {
            "recurring"
        } else if task.assignee_id.is_some() {
            "assigned"
        } else {
            "standard"
        };

        Self {
            project_name: project.map(|p| p.name.clone()),
            project_kind: project.map(|p| p.kind().to_string()),
            task_kind: task_kind.to_string(),
            priority_level: task.priority.level().to_string(),
            has_due_date: task.due.is_some(),
            is_recurring,
            has_description: !task.description.trim().is_empty(),
            is_subtask: task.parent_id.is_some(),
        }
    }
}

/// A task paired with its latest analysis and vector bookkeeping.
///
/// `fingerprint` is the fingerprint of `task` at the time it was processed
/// and is what change detection compares against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedTask {
    pub task: Task,
    pub fingerprint: Fingerprint,
    pub analysis: Option<AnalysisResult>,
    pub vector: Option<VectorRecord>,
    pub metadata: TaskMetadata,
    pub processed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_clamps_source_values() {
        assert_eq!(Priority::from_source(-3), Priority::None);
        assert_eq!(Priority::from_source(0), Priority::None);
        assert_eq!(Priority::from_source(3), Priority::High);
        assert_eq!(Priority::from_source(9), Priority::Urgent);
    }

    #[test]
    fn test_priority_serde_as_number() {
        let json = serde_json::to_string(&Priority::High).unwrap();
        assert_eq!(json, "3");
        let back: Priority = serde_json::from_str("4").unwrap();
        assert_eq!(back, Priority::Urgent);
        assert!(serde_json::from_str::<Priority>("7").is_err());
    }

    #[test]
    fn test_metadata_task_kinds() {
        let mut task = Task::new("t1", "p1", "Write report");
        assert_eq!(TaskMetadata::derive(&task, None).task_kind, "standard");

        task.due = Some(Due {
            date: "2024-05-06".into(),
            datetime: None,
            timezone: None,
            recurrence: Some("every monday".into()),
        });
        let meta = TaskMetadata::derive(&task, None);
        assert_eq!(meta.task_kind, "recurring");
        assert!(meta.is_recurring);
        assert!(meta.has_due_date);

        task.parent_id = Some("t0".into());
        assert_eq!(TaskMetadata::derive(&task, None).task_kind, "subtask");
    }

    #[test]
    fn test_metadata_project_kind() {
        let mut project = Project::new("p1", "Inbox");
        project.is_inbox_project = true;
        let task = Task::new("t1", "p1", "Call bank");
        let meta = TaskMetadata::derive(&task, Some(&project));
        assert_eq!(meta.project_name.as_deref(), Some("Inbox"));
        assert_eq!(meta.project_kind.as_deref(), Some("inbox"));
        assert_eq!(meta.priority_level, "none");
    }

    #[test]
    fn test_blank_task() {
        let mut task = Task::new("t1", "p1", "   ");
        assert!(task.is_blank());
        task.description = "details".into();
        assert!(!task.is_blank());
    }
}
