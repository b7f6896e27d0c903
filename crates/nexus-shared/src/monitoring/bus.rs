//! # Monitoring Event Bus
//!
//! Best-effort publisher of [`MonitoringEvent`]s. Publishing never blocks
//! the caller's progress: transport errors are retried with backoff, then
//! logged and dropped. Callers cannot observe a monitoring failure.
//!
//! ## Channel policy
//!
//! Every event goes to the global events channel. Events carrying a project
//! id additionally go to the project-scoped channel, and stats events
//! (`stats_snapshot`, `queue_depth_update`) additionally go to the stats
//! channel.
//!
//! ## Size cap
//!
//! Serialized events are bounded (default 8192 bytes). Oversized events are
//! reduced in order: `meta` replaced with `{"truncated": true,
//! "original_size": N}`, then `message` and `error` clipped to 500
//! characters with a `"... [truncated]"` suffix.

use std::time::Duration;

use tracing::{debug, error, warn};

use crate::config::MonitoringConfig;
use crate::monitoring::events::MonitoringEvent;
use crate::pubsub::PubSubProvider;

/// Publish attempts per channel (1 initial + 3 retries)
const MAX_ATTEMPTS: u32 = 4;
/// Backoff base delay
const BASE_DELAY: Duration = Duration::from_millis(100);
/// Backoff ceiling
const MAX_DELAY: Duration = Duration::from_secs(1);
/// Per-attempt publish deadline
const PUBLISH_DEADLINE: Duration = Duration::from_millis(200);
/// Clip length applied to `message` and `error` during size reduction
const TRUNCATED_TEXT_LEN: usize = 500;
const TRUNCATION_SUFFIX: &str = "... [truncated]";

/// Best-effort monitoring publisher.
#[derive(Debug, Clone)]
pub struct EventBus {
    provider: PubSubProvider,
    config: MonitoringConfig,
}

impl EventBus {
    pub fn new(provider: PubSubProvider, config: MonitoringConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    /// Publish an event. Returns whether the global-channel publish
    /// succeeded; failures are swallowed either way.
    pub async fn publish(&self, event: &MonitoringEvent) -> bool {
        if !self.config.enabled {
            return true; // no-op when monitoring is disabled
        }

        let payload = match self.serialize_bounded(event) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "failed to serialize monitoring event");
                return false;
            }
        };

        let success = self
            .publish_with_retry(&self.config.events_channel, &payload)
            .await;

        if success {
            if let Some(project_id) = &event.project_id {
                let channel = self.config.project_channel(project_id);
                self.publish_with_retry(&channel, &payload).await;
            }
        }

        if event.event_type.is_stats() {
            self.publish_with_retry(&self.config.stats_channel, &payload)
                .await;
        }

        success
    }

    /// Serialize, applying the size-reduction rules when over budget.
    fn serialize_bounded(&self, event: &MonitoringEvent) -> serde_json::Result<String> {
        let mut event = event.clone();
        let mut payload = serde_json::to_string(&event)?;

        if payload.len() <= self.config.max_event_size {
            return Ok(payload);
        }

        // Reduction 1: drop free-form metadata
        let original_size = payload.len();
        if event.meta.is_some() {
            event.meta = Some(serde_json::json!({
                "truncated": true,
                "original_size": original_size,
            }));
            payload = serde_json::to_string(&event)?;
        }

        // Reduction 2: clip message and error
        if payload.len() > self.config.max_event_size {
            if let Some(message) = event.message.take() {
                event.message = Some(clip_text(&message));
            }
            if let Some(err) = event.error.take() {
                event.error = Some(clip_text(&err));
            }
            payload = serde_json::to_string(&event)?;
        }

        Ok(payload)
    }

    /// Publish to one channel with exponential backoff and jitter.
    async fn publish_with_retry(&self, channel: &str, payload: &str) -> bool {
        for attempt in 0..MAX_ATTEMPTS {
            match tokio::time::timeout(PUBLISH_DEADLINE, self.provider.publish(channel, payload))
                .await
            {
                Ok(Ok(())) => return true,
                Ok(Err(e)) => {
                    warn!(channel = %channel, attempt = attempt + 1, error = %e, "monitoring publish error");
                }
                Err(_) => {
                    warn!(channel = %channel, attempt = attempt + 1, "monitoring publish timeout");
                }
            }

            if attempt + 1 < MAX_ATTEMPTS {
                let delay = BASE_DELAY
                    .checked_mul(1 << attempt)
                    .unwrap_or(MAX_DELAY)
                    .min(MAX_DELAY);
                let jitter = delay.mul_f64(fastrand::f64() * 0.1);
                tokio::time::sleep(delay + jitter).await;
            }
        }

        error!(channel = %channel, attempts = MAX_ATTEMPTS, "dropping monitoring event after retry exhaustion");
        false
    }
}

fn clip_text(text: &str) -> String {
    if text.chars().count() <= TRUNCATED_TEXT_LEN {
        return text.to_string();
    }
    let clipped: String = text.chars().take(TRUNCATED_TEXT_LEN).collect();
    format!("{clipped}{TRUNCATION_SUFFIX}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::events::MonitoringEventType;

    fn bus_with_provider() -> (EventBus, PubSubProvider) {
        let provider = PubSubProvider::new_in_memory();
        let bus = EventBus::new(provider.clone(), MonitoringConfig::default());
        (bus, provider)
    }

    #[tokio::test]
    async fn test_publish_reaches_global_channel() {
        let (bus, provider) = bus_with_provider();
        let mut stream = provider
            .subscribe(&["nexus:events".to_string()])
            .await
            .unwrap();

        let event = MonitoringEvent::task(MonitoringEventType::TaskStarted, "t1");
        assert!(bus.publish(&event).await);

        let (_, payload) = stream.recv().await.unwrap();
        let received: MonitoringEvent = serde_json::from_str(&payload).unwrap();
        assert_eq!(received.task_id.as_deref(), Some("t1"));
        assert_eq!(received.event_type, MonitoringEventType::TaskStarted);
    }

    #[tokio::test]
    async fn test_project_events_mirror_to_project_channel() {
        let (bus, provider) = bus_with_provider();
        let mut stream = provider
            .subscribe(&["nexus:events:project:p1".to_string()])
            .await
            .unwrap();

        let event =
            MonitoringEvent::task(MonitoringEventType::TaskCompleted, "t1").with_project("p1");
        bus.publish(&event).await;

        let (_, payload) = stream.recv().await.unwrap();
        assert!(payload.contains("\"project_id\":\"p1\""));
    }

    #[tokio::test]
    async fn test_stats_events_mirror_to_stats_channel() {
        let (bus, provider) = bus_with_provider();
        let mut stream = provider
            .subscribe(&["nexus:events:stats".to_string()])
            .await
            .unwrap();

        let event = MonitoringEvent::stats_snapshot(Default::default(), 2);
        bus.publish(&event).await;

        let (_, payload) = stream.recv().await.unwrap();
        assert!(payload.contains("\"event_type\":\"stats_snapshot\""));
    }

    #[tokio::test]
    async fn test_non_stats_events_skip_stats_channel() {
        let (bus, provider) = bus_with_provider();
        let mut stats = provider
            .subscribe(&["nexus:events:stats".to_string()])
            .await
            .unwrap();
        let mut global = provider
            .subscribe(&["nexus:events".to_string()])
            .await
            .unwrap();

        bus.publish(&MonitoringEvent::task(
            MonitoringEventType::TaskStarted,
            "t1",
        ))
        .await;
        bus.publish(&MonitoringEvent::stats_snapshot(Default::default(), 1))
            .await;

        // Global sees both; stats sees only the snapshot
        assert!(global.recv().await.is_some());
        assert!(global.recv().await.is_some());
        let (_, payload) = stats.recv().await.unwrap();
        assert!(payload.contains("stats_snapshot"));
    }

    #[tokio::test]
    async fn test_disabled_bus_is_noop_success() {
        let provider = PubSubProvider::new_in_memory();
        let config = MonitoringConfig {
            enabled: false,
            ..Default::default()
        };
        let bus = EventBus::new(provider.clone(), config);

        let mut stream = provider
            .subscribe(&["nexus:events".to_string()])
            .await
            .unwrap();
        assert!(
            bus.publish(&MonitoringEvent::new(MonitoringEventType::WorkerStarted))
                .await
        );

        // Nothing should arrive
        let got = tokio::time::timeout(Duration::from_millis(50), stream.recv()).await;
        assert!(got.is_err());
    }

    #[tokio::test]
    async fn test_oversized_meta_is_replaced_first() {
        let (bus, _) = bus_with_provider();
        let big_meta = serde_json::json!({ "blob": "x".repeat(20_000) });
        let event = MonitoringEvent::new(MonitoringEventType::TaskCompleted).with_meta(big_meta);

        let payload = bus.serialize_bounded(&event).unwrap();
        assert!(payload.len() <= 8192);
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["meta"]["truncated"], serde_json::json!(true));
        assert!(value["meta"]["original_size"].as_u64().unwrap() > 8192);
    }

    #[tokio::test]
    async fn test_oversized_message_and_error_are_clipped() {
        let (bus, _) = bus_with_provider();
        let event = MonitoringEvent::new(MonitoringEventType::TaskFailed)
            .with_message("m".repeat(9000))
            .with_error("e".repeat(9000));

        let payload = bus.serialize_bounded(&event).unwrap();
        assert!(payload.len() <= 8192);
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        let message = value["message"].as_str().unwrap();
        let error = value["error"].as_str().unwrap();
        assert!(message.ends_with("... [truncated]"));
        assert!(error.ends_with("... [truncated]"));
        assert_eq!(message.len(), 500 + "... [truncated]".len());
    }

    #[tokio::test]
    async fn test_small_events_pass_through_unchanged() {
        let (bus, _) = bus_with_provider();
        let event = MonitoringEvent::new(MonitoringEventType::WorkerHeartbeat)
            .with_message("short message");
        let payload = bus.serialize_bounded(&event).unwrap();
        assert!(payload.contains("short message"));
        assert!(!payload.contains("[truncated]"));
    }
}
