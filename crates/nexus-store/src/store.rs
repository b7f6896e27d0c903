//! # Knowledge Store Facade
//!
//! Idempotent persistence for every durable entity: tasks, subtasks,
//! operations, evidence, sources, and artifacts. All writes are
//! single-row upserts, so concurrent workers need no locking; the queue's
//! single-residency invariant means only one worker mutates a given task
//! at a time anyway.
//!
//! Two backends behind one enum, matching the messaging and queue layers:
//! `Postgres` for production, `InMemory` for tests and single-process
//! runs. Contracts enforced by both backends rather than by callers:
//!
//! - Title fields are clipped to 254 characters; missing titles become
//!   `"Untitled"`.
//! - A source URL maps to at most one row; rewrites merge missing fields,
//!   keep the longest extracted text, and advance `accessed_at`.
//! - Operation rows are immutable once `completed`/`failed`, apart from a
//!   single idempotent retry-marker write.
//! - Tasks never leave a terminal status.

use std::collections::HashMap;

use serde_json::Value;

use nexus_shared::types::{
    Artifact, JobEnvelope, NewSource, OperationEvidence, OperationStatus, ResearchTask, Source,
    Subtask, TaskOperation, TaskStatus,
};
use nexus_shared::NexusResult;

use crate::memory::InMemoryStore;
use crate::postgres::PostgresStore;

/// Literal token required by [`KnowledgeStore::purge_all`].
pub const PURGE_CONFIRMATION_TOKEN: &str = "DELETE ALL DATA";

/// Knowledge-store backend, enum-dispatched.
#[derive(Debug, Clone)]
pub enum KnowledgeStore {
    Postgres(PostgresStore),
    InMemory(InMemoryStore),
}

impl KnowledgeStore {
    /// Initialize the PostgreSQL pool (once per process) and run
    /// migrations.
    pub async fn connect(database_url: &str) -> NexusResult<Self> {
        Ok(Self::Postgres(PostgresStore::connect(database_url).await?))
    }

    /// In-memory backend for tests and single-process runs.
    pub fn new_in_memory() -> Self {
        Self::InMemory(InMemoryStore::new())
    }

    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgres",
            Self::InMemory(_) => "in_memory",
        }
    }

    /// True when the backend can execute a trivial round-trip.
    pub async fn health_check(&self) -> bool {
        match self {
            Self::Postgres(s) => s.health_check().await,
            Self::InMemory(_) => true,
        }
    }

    pub async fn close(&self) {
        if let Self::Postgres(s) = self {
            s.close().await;
        }
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    pub async fn upsert_task(&self, task: &ResearchTask) -> NexusResult<()> {
        match self {
            Self::Postgres(s) => s.upsert_task(task).await,
            Self::InMemory(s) => {
                s.upsert_task(task);
                Ok(())
            }
        }
    }

    /// Create the task row from a queue envelope if absent. Safe under
    /// duplicate delivery of the same task id.
    pub async fn ensure_task_from_envelope(&self, job: &JobEnvelope) -> NexusResult<ResearchTask> {
        match self {
            Self::Postgres(s) => s.ensure_task_from_envelope(job).await,
            Self::InMemory(s) => Ok(s.ensure_task_from_envelope(job)),
        }
    }

    pub async fn get_task(&self, task_id: &str) -> NexusResult<Option<ResearchTask>> {
        match self {
            Self::Postgres(s) => s.get_task(task_id).await,
            Self::InMemory(s) => Ok(s.get_task(task_id)),
        }
    }

    pub async fn list_tasks(&self, limit: i64) -> NexusResult<Vec<ResearchTask>> {
        match self {
            Self::Postgres(s) => s.list_tasks(limit).await,
            Self::InMemory(s) => Ok(s.list_tasks(limit.max(0) as usize)),
        }
    }

    /// Transition a task's status. Returns `false` (writing nothing) when
    /// the task is already terminal.
    pub async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
    ) -> NexusResult<bool> {
        match self {
            Self::Postgres(s) => s.update_task_status(task_id, status).await,
            Self::InMemory(s) => Ok(s.update_task_status(task_id, status)),
        }
    }

    pub async fn complete_task(
        &self,
        task_id: &str,
        results: Option<Value>,
        summary: Option<Value>,
        reasoning: Option<Value>,
    ) -> NexusResult<()> {
        match self {
            Self::Postgres(s) => s.complete_task(task_id, results, summary, reasoning).await,
            Self::InMemory(s) => {
                s.complete_task(task_id, results, summary, reasoning);
                Ok(())
            }
        }
    }

    pub async fn fail_task(&self, task_id: &str, error: &str, category: &str) -> NexusResult<()> {
        match self {
            Self::Postgres(s) => s.fail_task(task_id, error, category).await,
            Self::InMemory(s) => {
                s.fail_task(task_id, error, category);
                Ok(())
            }
        }
    }

    pub async fn record_task_error(&self, task_id: &str, error: &str) -> NexusResult<()> {
        match self {
            Self::Postgres(s) => s.record_task_error(task_id, error).await,
            Self::InMemory(s) => {
                s.record_task_error(task_id, error);
                Ok(())
            }
        }
    }

    // =========================================================================
    // Subtasks
    // =========================================================================

    pub async fn upsert_subtask(&self, subtask: &Subtask) -> NexusResult<()> {
        match self {
            Self::Postgres(s) => s.upsert_subtask(subtask).await,
            Self::InMemory(s) => {
                s.upsert_subtask(subtask);
                Ok(())
            }
        }
    }

    pub async fn subtasks_for_task(&self, task_id: &str) -> NexusResult<Vec<Subtask>> {
        match self {
            Self::Postgres(s) => s.subtasks_for_task(task_id).await,
            Self::InMemory(s) => Ok(s.subtasks_for_task(task_id)),
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    pub async fn open_operation(&self, task_id: &str, stage: &str) -> NexusResult<TaskOperation> {
        match self {
            Self::Postgres(s) => s.open_operation(task_id, stage).await,
            Self::InMemory(s) => Ok(s.open_operation(task_id, stage)),
        }
    }

    pub async fn find_operation(
        &self,
        task_id: &str,
        stage: &str,
    ) -> NexusResult<Option<TaskOperation>> {
        match self {
            Self::Postgres(s) => s.find_operation(task_id, stage).await,
            Self::InMemory(s) => Ok(s.find_operation(task_id, stage)),
        }
    }

    /// Replay-safety check: whether a completed operation row already
    /// exists for this (task, stage) pair.
    pub async fn stage_already_completed(&self, task_id: &str, stage: &str) -> NexusResult<bool> {
        match self {
            Self::Postgres(s) => s.stage_already_completed(task_id, stage).await,
            Self::InMemory(s) => Ok(s.stage_already_completed(task_id, stage)),
        }
    }

    /// Close a running operation with a final status. Rejected once the
    /// row is final.
    pub async fn close_operation(
        &self,
        operation_id: &str,
        status: OperationStatus,
        error: Option<&str>,
        counts: &HashMap<String, i64>,
    ) -> NexusResult<()> {
        match self {
            Self::Postgres(s) => s.close_operation(operation_id, status, error, counts).await,
            Self::InMemory(s) => s.close_operation(operation_id, status, error, counts),
        }
    }

    /// The single post-final write an operation accepts: an idempotent
    /// retry marker.
    pub async fn mark_operation_retried(&self, operation_id: &str) -> NexusResult<()> {
        match self {
            Self::Postgres(s) => s.mark_operation_retried(operation_id).await,
            Self::InMemory(s) => {
                s.mark_operation_retried(operation_id);
                Ok(())
            }
        }
    }

    // =========================================================================
    // Evidence
    // =========================================================================

    pub async fn append_evidence(&self, evidence: &OperationEvidence) -> NexusResult<()> {
        match self {
            Self::Postgres(s) => s.append_evidence(evidence).await,
            Self::InMemory(s) => {
                s.append_evidence(evidence);
                Ok(())
            }
        }
    }

    pub async fn evidence_for_operation(
        &self,
        operation_id: &str,
    ) -> NexusResult<Vec<OperationEvidence>> {
        match self {
            Self::Postgres(s) => s.evidence_for_operation(operation_id).await,
            Self::InMemory(s) => Ok(s.evidence_for_operation(operation_id)),
        }
    }

    // =========================================================================
    // Sources
    // =========================================================================

    /// Upsert by URL; never inserts a duplicate row.
    pub async fn upsert_source(&self, new_source: NewSource) -> NexusResult<Source> {
        match self {
            Self::Postgres(s) => s.upsert_source(new_source).await,
            Self::InMemory(s) => Ok(s.upsert_source(new_source)),
        }
    }

    pub async fn get_source_by_url(&self, url: &str) -> NexusResult<Option<Source>> {
        match self {
            Self::Postgres(s) => s.get_source_by_url(url).await,
            Self::InMemory(s) => Ok(s.get_source_by_url(url)),
        }
    }

    pub async fn count_sources(&self) -> NexusResult<i64> {
        match self {
            Self::Postgres(s) => s.count_sources().await,
            Self::InMemory(s) => Ok(s.count_sources()),
        }
    }

    // =========================================================================
    // Artifacts
    // =========================================================================

    pub async fn create_artifact(&self, artifact: &Artifact) -> NexusResult<()> {
        match self {
            Self::Postgres(s) => s.create_artifact(artifact).await,
            Self::InMemory(s) => {
                s.create_artifact(artifact);
                Ok(())
            }
        }
    }

    pub async fn artifacts_for_task(&self, task_id: &str) -> NexusResult<Vec<Artifact>> {
        match self {
            Self::Postgres(s) => s.artifacts_for_task(task_id).await,
            Self::InMemory(s) => Ok(s.artifacts_for_task(task_id)),
        }
    }

    // =========================================================================
    // Admin
    // =========================================================================

    /// Delete everything. Refuses without the literal confirmation token.
    pub async fn purge_all(&self, confirmation_token: &str) -> NexusResult<()> {
        match self {
            Self::Postgres(s) => s.purge_all(confirmation_token).await,
            Self::InMemory(s) => {
                if confirmation_token != PURGE_CONFIRMATION_TOKEN {
                    return Err(nexus_shared::NexusError::ConfirmationRequired(
                        "store purge".to_string(),
                    ));
                }
                s.purge();
                Ok(())
            }
        }
    }
}
