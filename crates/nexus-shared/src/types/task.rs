//! Research task and decomposition-node models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ordered lifecycle of a research task. Declaration order is the pipeline
/// order; the observed status sequence for any task is a prefix of it,
/// optionally followed by `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Planning,
    Searching,
    Aggregating,
    Summarizing,
    Reasoning,
    GeneratingArtifacts,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ORDERED: [TaskStatus; 8] = [
        TaskStatus::Created,
        TaskStatus::Planning,
        TaskStatus::Searching,
        TaskStatus::Aggregating,
        TaskStatus::Summarizing,
        TaskStatus::Reasoning,
        TaskStatus::GeneratingArtifacts,
        TaskStatus::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Planning => "planning",
            Self::Searching => "searching",
            Self::Aggregating => "aggregating",
            Self::Summarizing => "summarizing",
            Self::Reasoning => "reasoning",
            Self::GeneratingArtifacts => "generating_artifacts",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "created" => Some(Self::Created),
            "planning" => Some(Self::Planning),
            "searching" => Some(Self::Searching),
            "aggregating" => Some(Self::Aggregating),
            "summarizing" => Some(Self::Summarizing),
            "reasoning" => Some(Self::Reasoning),
            "generating_artifacts" => Some(Self::GeneratingArtifacts),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user research request. The knowledge store holds the truth; queue
/// entries carry the id only. Mutated only by the worker that owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchTask {
    pub task_id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub continuous_mode: bool,
    pub continuous_interval_hours: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Opaque task metadata; failure category and error land here
    #[serde(default)]
    pub metadata: Value,
    pub results: Option<Value>,
    pub summary: Option<Value>,
    pub reasoning: Option<Value>,
}

impl ResearchTask {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: super::new_id(),
            title: title.into(),
            description: description.into(),
            status: TaskStatus::Created,
            continuous_mode: false,
            continuous_interval_hours: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            metadata: Value::Null,
            results: None,
            summary: None,
            reasoning: None,
        }
    }
}

/// One node in the sub-topic decomposition tree of a task.
///
/// The tree is finite and rooted at exactly one node per task
/// (`parent_id == None`); children are referenced by ordered id list so the
/// store can persist nodes row-by-row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub subtask_id: String,
    pub task_id: String,
    pub parent_id: Option<String>,
    pub description: String,
    pub status: TaskStatus,
    pub assigned_agent: Option<String>,
    pub result: Option<Value>,
    #[serde(default)]
    pub children: Vec<String>,
    /// Key questions attached to this node by the decomposer
    #[serde(default)]
    pub key_questions: Vec<String>,
    /// Candidate data-source URLs attached by the decomposer
    #[serde(default)]
    pub data_sources: Vec<String>,
    pub depth: u32,
}

impl Subtask {
    pub fn root(task_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            subtask_id: super::new_id(),
            task_id: task_id.into(),
            parent_id: None,
            description: description.into(),
            status: TaskStatus::Created,
            assigned_agent: None,
            result: None,
            children: Vec::new(),
            key_questions: Vec::new(),
            data_sources: Vec::new(),
            depth: 0,
        }
    }

    pub fn child_of(parent: &Subtask, description: impl Into<String>) -> Self {
        Self {
            subtask_id: super::new_id(),
            task_id: parent.task_id.clone(),
            parent_id: Some(parent.subtask_id.clone()),
            description: description.into(),
            status: TaskStatus::Created,
            assigned_agent: None,
            result: None,
            children: Vec::new(),
            key_questions: Vec::new(),
            data_sources: Vec::new(),
            depth: parent.depth + 1,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}
