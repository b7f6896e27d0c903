//! Per-stage operation rows and their append-only evidence.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of one stage execution. `Completed` and `Failed` are final;
/// the only write accepted afterwards is the retry-marker increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Running,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One row per pipeline-stage execution for one task. Immutable after
/// completion apart from the retry marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOperation {
    pub operation_id: String,
    pub task_id: String,
    /// Stage name (`planning`, `searching`, ...)
    pub stage: String,
    pub status: OperationStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// e.g. `{"sources_examined": 12, "evidence_items": 4}`
    #[serde(default)]
    pub counts: HashMap<String, i64>,
    pub retry_marker: i32,
}

impl TaskOperation {
    pub fn open(task_id: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            operation_id: super::new_id(),
            task_id: task_id.into(),
            stage: stage.into(),
            status: OperationStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
            counts: HashMap::new(),
            retry_marker: 0,
        }
    }
}

/// Classification of an evidence record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    SearchResult,
    ExtractedFact,
    SummaryFragment,
    ReasoningConclusion,
}

impl EvidenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SearchResult => "search_result",
            Self::ExtractedFact => "extracted_fact",
            Self::SummaryFragment => "summary_fragment",
            Self::ReasoningConclusion => "reasoning_conclusion",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "search_result" => Some(Self::SearchResult),
            "extracted_fact" => Some(Self::ExtractedFact),
            "summary_fragment" => Some(Self::SummaryFragment),
            "reasoning_conclusion" => Some(Self::ReasoningConclusion),
            _ => None,
        }
    }
}

/// Where an evidence payload came from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Provenance {
    pub source_url: Option<String>,
    pub provider: Option<String>,
    pub retrieved_at: Option<DateTime<Utc>>,
}

/// Append-only record attached to an operation. Never deleted except by
/// the explicit data-purge admin operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationEvidence {
    pub evidence_id: String,
    pub operation_id: String,
    pub kind: EvidenceKind,
    pub payload: Value,
    pub provenance: Provenance,
    pub created_at: DateTime<Utc>,
}

impl OperationEvidence {
    pub fn new(operation_id: impl Into<String>, kind: EvidenceKind, payload: Value) -> Self {
        Self {
            evidence_id: super::new_id(),
            operation_id: operation_id.into(),
            kind,
            payload,
            provenance: Provenance::default(),
            created_at: Utc::now(),
        }
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_opens_running() {
        let op = TaskOperation::open("t1", "planning");
        assert_eq!(op.status, OperationStatus::Running);
        assert!(op.ended_at.is_none());
        assert_eq!(op.retry_marker, 0);
    }

    #[test]
    fn test_final_statuses() {
        assert!(OperationStatus::Completed.is_final());
        assert!(OperationStatus::Failed.is_final());
        assert!(!OperationStatus::Running.is_final());
    }

    #[test]
    fn test_evidence_kind_strings() {
        assert_eq!(EvidenceKind::SearchResult.as_str(), "search_result");
        assert_eq!(
            EvidenceKind::parse("reasoning_conclusion"),
            Some(EvidenceKind::ReasoningConclusion)
        );
        assert_eq!(EvidenceKind::parse("other"), None);
    }
}
