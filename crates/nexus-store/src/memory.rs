//! In-memory knowledge-store backend for tests and single-process runs.
//!
//! Implements the same contracts as the PostgreSQL backend — title
//! clipping, source merge rules, operation finality, terminal status lock —
//! over plain maps behind one mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;

use nexus_shared::types::{
    Artifact, JobEnvelope, NewSource, OperationEvidence, OperationStatus, ResearchTask, Source,
    Subtask, TaskOperation, TaskStatus,
};
use nexus_shared::validation::{clip_title, UNTITLED};
use nexus_shared::{NexusError, NexusResult};

#[derive(Debug, Default)]
struct StoreState {
    tasks: HashMap<String, ResearchTask>,
    subtasks: HashMap<String, Subtask>,
    operations: HashMap<String, TaskOperation>,
    evidence: Vec<OperationEvidence>,
    /// Keyed by URL — the dedup invariant holds by construction
    sources: HashMap<String, Source>,
    artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn upsert_task(&self, task: &ResearchTask) {
        let mut stored = task.clone();
        stored.title = clip_title(Some(&task.title));
        stored.updated_at = Utc::now();
        self.lock().tasks.insert(stored.task_id.clone(), stored);
    }

    pub fn ensure_task_from_envelope(&self, job: &JobEnvelope) -> ResearchTask {
        if let Some(existing) = self.get_task(&job.task_id) {
            return existing;
        }
        let mut task = ResearchTask::new(job.title.clone(), job.description.clone());
        task.task_id = job.task_id.clone();
        task.continuous_mode = job.continuous_mode;
        task.continuous_interval_hours = job.continuous_interval_hours;
        self.upsert_task(&task);
        self.get_task(&job.task_id).expect("task just inserted")
    }

    pub fn get_task(&self, task_id: &str) -> Option<ResearchTask> {
        self.lock().tasks.get(task_id).cloned()
    }

    pub fn list_tasks(&self, limit: usize) -> Vec<ResearchTask> {
        let mut tasks: Vec<_> = self.lock().tasks.values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.truncate(limit);
        tasks
    }

    pub fn update_task_status(&self, task_id: &str, status: TaskStatus) -> bool {
        let mut state = self.lock();
        match state.tasks.get_mut(task_id) {
            Some(task) if !task.status.is_terminal() => {
                task.status = status;
                task.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    pub fn complete_task(
        &self,
        task_id: &str,
        results: Option<Value>,
        summary: Option<Value>,
        reasoning: Option<Value>,
    ) {
        let mut state = self.lock();
        if let Some(task) = state.tasks.get_mut(task_id) {
            if task.status.is_terminal() {
                return;
            }
            task.status = TaskStatus::Completed;
            task.completed_at = Some(Utc::now());
            task.updated_at = Utc::now();
            if results.is_some() {
                task.results = results;
            }
            if summary.is_some() {
                task.summary = summary;
            }
            if reasoning.is_some() {
                task.reasoning = reasoning;
            }
        }
    }

    pub fn fail_task(&self, task_id: &str, error: &str, category: &str) {
        let mut state = self.lock();
        if let Some(task) = state.tasks.get_mut(task_id) {
            if task.status.is_terminal() {
                return;
            }
            task.status = TaskStatus::Failed;
            task.updated_at = Utc::now();
            let mut meta = match task.metadata.take() {
                Value::Object(map) => map,
                _ => serde_json::Map::new(),
            };
            meta.insert("error".to_string(), Value::String(error.to_string()));
            meta.insert(
                "error_category".to_string(),
                Value::String(category.to_string()),
            );
            task.metadata = Value::Object(meta);
        }
    }

    pub fn record_task_error(&self, task_id: &str, error: &str) {
        let mut state = self.lock();
        if let Some(task) = state.tasks.get_mut(task_id) {
            task.updated_at = Utc::now();
            let mut meta = match task.metadata.take() {
                Value::Object(map) => map,
                _ => serde_json::Map::new(),
            };
            meta.insert("last_error".to_string(), Value::String(error.to_string()));
            task.metadata = Value::Object(meta);
        }
    }

    pub fn upsert_subtask(&self, subtask: &Subtask) {
        self.lock()
            .subtasks
            .insert(subtask.subtask_id.clone(), subtask.clone());
    }

    pub fn subtasks_for_task(&self, task_id: &str) -> Vec<Subtask> {
        let mut subtasks: Vec<_> = self
            .lock()
            .subtasks
            .values()
            .filter(|s| s.task_id == task_id)
            .cloned()
            .collect();
        subtasks.sort_by(|a, b| a.depth.cmp(&b.depth).then(a.subtask_id.cmp(&b.subtask_id)));
        subtasks
    }

    pub fn open_operation(&self, task_id: &str, stage: &str) -> TaskOperation {
        let operation = TaskOperation::open(task_id, stage);
        self.lock()
            .operations
            .insert(operation.operation_id.clone(), operation.clone());
        operation
    }

    pub fn find_operation(&self, task_id: &str, stage: &str) -> Option<TaskOperation> {
        self.lock()
            .operations
            .values()
            .filter(|op| op.task_id == task_id && op.stage == stage)
            .max_by_key(|op| op.started_at)
            .cloned()
    }

    pub fn stage_already_completed(&self, task_id: &str, stage: &str) -> bool {
        self.find_operation(task_id, stage)
            .map(|op| op.status == OperationStatus::Completed)
            .unwrap_or(false)
    }

    pub fn close_operation(
        &self,
        operation_id: &str,
        status: OperationStatus,
        error: Option<&str>,
        counts: &HashMap<String, i64>,
    ) -> NexusResult<()> {
        if !status.is_final() {
            return Err(NexusError::Store(
                "close_operation requires a final status".to_string(),
            ));
        }
        let mut state = self.lock();
        let operation = state
            .operations
            .get_mut(operation_id)
            .ok_or_else(|| NexusError::Store(format!("unknown operation {operation_id}")))?;
        if operation.status.is_final() {
            return Err(NexusError::Store(format!(
                "operation {operation_id} is already final"
            )));
        }
        operation.status = status;
        operation.ended_at = Some(Utc::now());
        operation.error = error.map(str::to_string);
        operation.counts = counts.clone();
        Ok(())
    }

    pub fn mark_operation_retried(&self, operation_id: &str) {
        if let Some(operation) = self.lock().operations.get_mut(operation_id) {
            operation.retry_marker = 1;
        }
    }

    pub fn append_evidence(&self, evidence: &OperationEvidence) {
        self.lock().evidence.push(evidence.clone());
    }

    pub fn evidence_for_operation(&self, operation_id: &str) -> Vec<OperationEvidence> {
        self.lock()
            .evidence
            .iter()
            .filter(|e| e.operation_id == operation_id)
            .cloned()
            .collect()
    }

    pub fn upsert_source(&self, new_source: NewSource) -> Source {
        let incoming_title = new_source.title.as_deref().map(|t| clip_title(Some(t)));
        let incoming = new_source.into_source();
        let mut state = self.lock();

        match state.sources.get_mut(&incoming.url) {
            Some(existing) => {
                if existing.title == UNTITLED {
                    if let Some(title) = incoming_title {
                        existing.title = title;
                    }
                }
                if existing.provider.is_none() {
                    existing.provider = incoming.provider;
                }
                if existing.content_hash.is_none() {
                    existing.content_hash = incoming.content_hash;
                }
                let incoming_longer = match (&existing.extracted_text, &incoming.extracted_text) {
                    (None, Some(_)) => true,
                    (Some(old), Some(new)) => new.len() > old.len(),
                    _ => false,
                };
                if incoming_longer {
                    existing.extracted_text = incoming.extracted_text;
                }
                if incoming.accessed_at > existing.accessed_at {
                    existing.accessed_at = incoming.accessed_at;
                }
                existing.clone()
            }
            None => {
                state
                    .sources
                    .insert(incoming.url.clone(), incoming.clone());
                incoming
            }
        }
    }

    pub fn get_source_by_url(&self, url: &str) -> Option<Source> {
        self.lock().sources.get(url).cloned()
    }

    pub fn count_sources(&self) -> i64 {
        self.lock().sources.len() as i64
    }

    pub fn create_artifact(&self, artifact: &Artifact) {
        let mut state = self.lock();
        if !state
            .artifacts
            .iter()
            .any(|a| a.artifact_id == artifact.artifact_id)
        {
            state.artifacts.push(artifact.clone());
        }
    }

    pub fn artifacts_for_task(&self, task_id: &str) -> Vec<Artifact> {
        self.lock()
            .artifacts
            .iter()
            .filter(|a| a.task_id == task_id)
            .cloned()
            .collect()
    }

    pub fn purge(&self) {
        *self.lock() = StoreState::default();
    }
}
