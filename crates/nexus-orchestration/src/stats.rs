//! Periodic queue-depth publisher feeding the monitoring stream.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use nexus_shared::monitoring::{MonitoringEvent, MonitoringEventType};

use crate::context::SystemContext;

/// Emit a `queue_depth_update` every `interval` until cancelled.
pub async fn run_stats_publisher(
    ctx: Arc<SystemContext>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    info!(interval_secs = interval.as_secs(), "stats publisher started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("stats publisher stopping");
                break;
            }
            _ = tokio::time::sleep(interval) => {
                let depths = ctx.queue.queue_depths().await.unwrap_or_default();
                let workers = ctx.queue.workers_online().await.unwrap_or(0);
                let event = MonitoringEvent {
                    queue: Some(depths.as_map()),
                    meta: Some(serde_json::json!({ "workers_online": workers })),
                    ..MonitoringEvent::new(MonitoringEventType::QueueDepthUpdate)
                };
                ctx.event_bus.publish(&event).await;
            }
        }
    }
}
