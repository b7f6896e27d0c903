//! Queue payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Priority tier of a queued job. Tiers are independent FIFOs; pops scan
/// high → normal → low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// Scan order for pops.
    pub const ORDERED: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

/// Serialized queue payload. Carries enough to recreate the task row if the
/// store lost it; the knowledge store remains the source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub task_id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub continuous_mode: bool,
    #[serde(default)]
    pub continuous_interval_hours: Option<u32>,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    /// Bumped each time a continuous-mode task is re-enqueued
    #[serde(default)]
    pub run_counter: u32,
}

impl JobEnvelope {
    pub fn new(
        task_id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        priority: Priority,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            title: title.into(),
            description: description.into(),
            continuous_mode: false,
            continuous_interval_hours: None,
            priority,
            enqueued_at: Utc::now(),
            retry_count: 0,
            run_counter: 0,
        }
    }

    /// A fresh envelope for the next continuous-mode run of the same task.
    pub fn next_run(&self) -> Self {
        Self {
            enqueued_at: Utc::now(),
            retry_count: 0,
            run_counter: self.run_counter + 1,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_json_round_trip_is_stable() {
        let job = JobEnvelope::new("t1", "AI in Healthcare", "Impact of AI", Priority::Normal);
        let bytes = serde_json::to_vec(&job).unwrap();
        let back: JobEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(job, back);
        // Re-serialization is byte-identical: envelopes survive the queue intact
        assert_eq!(bytes, serde_json::to_vec(&back).unwrap());
    }

    #[test]
    fn test_next_run_bumps_counter_and_resets_retries() {
        let mut job = JobEnvelope::new("t1", "a", "b", Priority::Low);
        job.retry_count = 3;
        let next = job.next_run();
        assert_eq!(next.run_counter, 1);
        assert_eq!(next.retry_count, 0);
        assert_eq!(next.task_id, job.task_id);
    }

    #[test]
    fn test_priority_scan_order() {
        assert_eq!(
            Priority::ORDERED,
            [Priority::High, Priority::Normal, Priority::Low]
        );
    }
}
