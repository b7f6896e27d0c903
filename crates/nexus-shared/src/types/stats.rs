//! Worker heartbeat and aggregate statistics records.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Published under `nexus:worker:heartbeat:{worker_id}` with a 30 s TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: u32,
    pub status: String,
    pub current_task_id: Option<String>,
    pub last_seen: DateTime<Utc>,
}

impl WorkerHeartbeat {
    pub fn active(worker_id: u32, current_task_id: Option<String>) -> Self {
        Self {
            worker_id,
            status: "active".to_string(),
            current_task_id,
            last_seen: Utc::now(),
        }
    }
}

/// Queue depth by priority tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepths {
    pub high_priority: u64,
    pub normal_priority: u64,
    pub low_priority: u64,
}

impl QueueDepths {
    pub fn total(&self) -> u64 {
        self.high_priority + self.normal_priority + self.low_priority
    }

    pub fn as_map(&self) -> HashMap<String, i64> {
        HashMap::from([
            ("high_priority".to_string(), self.high_priority as i64),
            ("normal_priority".to_string(), self.normal_priority as i64),
            ("low_priority".to_string(), self.low_priority as i64),
            ("total".to_string(), self.total() as i64),
        ])
    }
}

/// Snapshot serialized into `stats_snapshot` events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalStats {
    pub workers_online: u32,
    pub queue: QueueDepths,
    pub tasks_in_progress: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_depth_totals() {
        let depths = QueueDepths {
            high_priority: 1,
            normal_priority: 2,
            low_priority: 3,
        };
        assert_eq!(depths.total(), 6);
        assert_eq!(depths.as_map()["total"], 6);
    }
}
