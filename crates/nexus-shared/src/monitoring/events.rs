//! Monitoring event schema. Events are ephemeral: published, streamed,
//! never persisted.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every event type the monitoring plane emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitoringEventType {
    // Worker lifecycle
    WorkerStarted,
    WorkerHeartbeat,
    WorkerStopped,
    // Task lifecycle
    TaskEnqueued,
    TaskStarted,
    TaskRetry,
    TaskCompleted,
    TaskFailed,
    TaskStalled,
    // Pipeline phases
    PhaseStarted,
    PhaseCompleted,
    // System stats
    QueueDepthUpdate,
    StatsSnapshot,
}

impl MonitoringEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkerStarted => "worker_started",
            Self::WorkerHeartbeat => "worker_heartbeat",
            Self::WorkerStopped => "worker_stopped",
            Self::TaskEnqueued => "task_enqueued",
            Self::TaskStarted => "task_started",
            Self::TaskRetry => "task_retry",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::TaskStalled => "task_stalled",
            Self::PhaseStarted => "phase_started",
            Self::PhaseCompleted => "phase_completed",
            Self::QueueDepthUpdate => "queue_depth_update",
            Self::StatsSnapshot => "stats_snapshot",
        }
    }

    /// Stats events are additionally mirrored to the stats channel and are
    /// the only events a `stats_only` stream subscriber receives.
    pub fn is_stats(&self) -> bool {
        matches!(self, Self::QueueDepthUpdate | Self::StatsSnapshot)
    }
}

impl std::fmt::Display for MonitoringEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One monitoring event. Optional fields serialize only when present so the
/// wire form stays compact; the serialized size ceiling is enforced by the
/// event bus at publish time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringEvent {
    pub event_id: String,
    pub ts: DateTime<Utc>,
    pub event_type: MonitoringEventType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Research task id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    /// Job id from the queue
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// e.g. `{completed, failed, pending, queued}`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counts: Option<HashMap<String, i64>>,
    /// Queue depth by priority
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<HashMap<String, i64>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl MonitoringEvent {
    pub fn new(event_type: MonitoringEventType) -> Self {
        Self {
            event_id: crate::types::new_id(),
            ts: Utc::now(),
            event_type,
            project_id: None,
            parent_task_id: None,
            task_id: None,
            task_type: None,
            phase: None,
            worker_id: None,
            retry_count: None,
            status: None,
            duration_ms: None,
            counts: None,
            queue: None,
            message: None,
            error: None,
            meta: None,
        }
    }

    /// Worker lifecycle event.
    pub fn worker(event_type: MonitoringEventType, worker_id: u32) -> Self {
        let mut event = Self::new(event_type);
        event.worker_id = Some(worker_id);
        event
    }

    /// Task lifecycle event.
    pub fn task(event_type: MonitoringEventType, task_id: impl Into<String>) -> Self {
        let mut event = Self::new(event_type);
        let id = task_id.into();
        event.parent_task_id = Some(id.clone());
        event.task_id = Some(id);
        event
    }

    /// Pipeline phase event.
    pub fn phase(
        event_type: MonitoringEventType,
        phase: impl Into<String>,
        parent_task_id: impl Into<String>,
    ) -> Self {
        let mut event = Self::new(event_type);
        event.phase = Some(phase.into());
        event.parent_task_id = Some(parent_task_id.into());
        event
    }

    /// Stats snapshot with queue depths and online worker count.
    pub fn stats_snapshot(queue: HashMap<String, i64>, workers_online: u32) -> Self {
        let mut event = Self::new(MonitoringEventType::StatsSnapshot);
        event.queue = Some(queue);
        event.meta = Some(serde_json::json!({ "workers_online": workers_online }));
        event
    }

    pub fn with_worker(mut self, worker_id: u32) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_counts(mut self, counts: HashMap<String, i64>) -> Self {
        self.counts = Some(counts);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_strings() {
        assert_eq!(MonitoringEventType::TaskEnqueued.as_str(), "task_enqueued");
        assert_eq!(
            MonitoringEventType::PhaseCompleted.as_str(),
            "phase_completed"
        );
        assert_eq!(MonitoringEventType::StatsSnapshot.as_str(), "stats_snapshot");
    }

    #[test]
    fn test_stats_classification() {
        assert!(MonitoringEventType::StatsSnapshot.is_stats());
        assert!(MonitoringEventType::QueueDepthUpdate.is_stats());
        assert!(!MonitoringEventType::TaskStarted.is_stats());
    }

    #[test]
    fn test_absent_fields_do_not_serialize() {
        let event = MonitoringEvent::new(MonitoringEventType::WorkerStarted);
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("\"error\""));
        assert!(!json.contains("\"meta\""));
        assert!(json.contains("\"event_type\":\"worker_started\""));
    }

    #[test]
    fn test_task_event_sets_both_ids() {
        let event = MonitoringEvent::task(MonitoringEventType::TaskStarted, "t-42");
        assert_eq!(event.task_id.as_deref(), Some("t-42"));
        assert_eq!(event.parent_task_id.as_deref(), Some("t-42"));
    }

    #[test]
    fn test_event_ids_are_unique() {
        let a = MonitoringEvent::new(MonitoringEventType::WorkerHeartbeat);
        let b = MonitoringEvent::new(MonitoringEventType::WorkerHeartbeat);
        assert_ne!(a.event_id, b.event_id);
    }
}
