//! Client-declared event filters for the live stream.

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::Value;

/// Query parameters accepted by `/ws/monitor`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MonitorParams {
    pub project_id: Option<String>,
    pub task_id: Option<String>,
    /// Comma-separated allow-list of event types
    pub types: Option<String>,
    #[serde(default)]
    pub stats_only: bool,
}

/// Parsed filter applied to every event before delivery.
#[derive(Debug, Clone, Default)]
pub struct ClientFilter {
    pub project_id: Option<String>,
    pub task_id: Option<String>,
    pub event_types: Option<HashSet<String>>,
    pub stats_only: bool,
}

impl From<MonitorParams> for ClientFilter {
    fn from(params: MonitorParams) -> Self {
        let event_types = params.types.as_deref().map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        });
        Self {
            project_id: params.project_id,
            task_id: params.task_id,
            event_types,
            stats_only: params.stats_only,
        }
    }
}

impl ClientFilter {
    /// Every declared constraint must pass.
    pub fn matches(&self, event: &Value) -> bool {
        let event_type = event["event_type"].as_str().unwrap_or_default();

        if self.stats_only
            && !matches!(event_type, "stats_snapshot" | "queue_depth_update")
        {
            return false;
        }

        if let Some(allowed) = &self.event_types {
            if !allowed.contains(event_type) {
                return false;
            }
        }

        if let Some(project_id) = &self.project_id {
            if event["project_id"].as_str() != Some(project_id) {
                return false;
            }
        }

        if let Some(task_id) = &self.task_id {
            let matches_task = event["parent_task_id"].as_str() == Some(task_id)
                || event["task_id"].as_str() == Some(task_id);
            if !matches_task {
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filter(params: MonitorParams) -> ClientFilter {
        params.into()
    }

    #[test]
    fn test_stats_only_admits_only_stats_events() {
        let f = filter(MonitorParams {
            stats_only: true,
            ..Default::default()
        });
        assert!(f.matches(&json!({"event_type": "stats_snapshot"})));
        assert!(f.matches(&json!({"event_type": "queue_depth_update"})));
        assert!(!f.matches(&json!({"event_type": "task_started"})));
        assert!(!f.matches(&json!({"event_type": "phase_completed"})));
    }

    #[test]
    fn test_type_allowlist() {
        let f = filter(MonitorParams {
            types: Some("task_started,task_completed".to_string()),
            ..Default::default()
        });
        assert!(f.matches(&json!({"event_type": "task_started"})));
        assert!(f.matches(&json!({"event_type": "task_completed"})));
        assert!(!f.matches(&json!({"event_type": "phase_started"})));
        assert!(!f.matches(&json!({"event_type": "stats_snapshot"})));
    }

    #[test]
    fn test_project_filter_requires_matching_project() {
        let f = filter(MonitorParams {
            project_id: Some("p1".to_string()),
            ..Default::default()
        });
        assert!(f.matches(&json!({"event_type": "task_started", "project_id": "p1"})));
        assert!(!f.matches(&json!({"event_type": "task_started", "project_id": "p2"})));
        assert!(!f.matches(&json!({"event_type": "task_started"})));
    }

    #[test]
    fn test_task_filter_matches_either_id_field() {
        let f = filter(MonitorParams {
            task_id: Some("t1".to_string()),
            ..Default::default()
        });
        assert!(f.matches(&json!({"event_type": "task_started", "parent_task_id": "t1"})));
        assert!(f.matches(&json!({"event_type": "task_started", "task_id": "t1"})));
        assert!(!f.matches(&json!({"event_type": "task_started", "task_id": "t2"})));
    }

    #[test]
    fn test_unfiltered_client_sees_everything() {
        let f = filter(MonitorParams::default());
        assert!(f.matches(&json!({"event_type": "worker_heartbeat"})));
        assert!(f.matches(&json!({"event_type": "stats_snapshot"})));
    }

    #[test]
    fn test_types_parsing_trims_whitespace() {
        let f = filter(MonitorParams {
            types: Some(" task_started , task_failed ".to_string()),
            ..Default::default()
        });
        assert!(f.matches(&json!({"event_type": "task_failed"})));
    }
}
