//! # Queue Supervisor
//!
//! Crash-safety for at-least-once delivery. Workers publish heartbeats
//! with a TTL; the supervisor periodically scans every in-flight set and
//! treats a worker as dead once its heartbeat is missing or older than 2×
//! the heartbeat interval. Each orphaned envelope is pushed back to the
//! **head** of its original priority tier with its retry count bumped and
//! a `task_retry` event emitted; an envelope whose retry count has reached
//! the ceiling goes to the dead-letter list with a `task_failed` event.

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use nexus_shared::monitoring::{EventBus, MonitoringEvent, MonitoringEventType};
use nexus_shared::types::JobEnvelope;
use nexus_shared::NexusResult;

use crate::queue::WorkQueueProvider;

/// Retry ceiling; a job popped this many times without completion is dead.
pub const MAX_RETRIES: u32 = 5;

/// Outcome of one supervisor scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorReport {
    pub stale_workers: u32,
    pub requeued: u32,
    pub dead_lettered: u32,
}

#[derive(Debug, Clone)]
pub struct QueueSupervisor {
    queue: WorkQueueProvider,
    event_bus: EventBus,
    /// Heartbeats older than this mark a worker dead (2× heartbeat interval)
    stale_after: Duration,
    scan_interval: Duration,
}

impl QueueSupervisor {
    pub fn new(
        queue: WorkQueueProvider,
        event_bus: EventBus,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            queue,
            event_bus,
            stale_after: heartbeat_interval * 2,
            scan_interval: heartbeat_interval,
        }
    }

    /// Run until cancelled, scanning once per heartbeat interval.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            stale_after_secs = self.stale_after.as_secs(),
            "queue supervisor started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("queue supervisor stopping");
                    break;
                }
                _ = tokio::time::sleep(self.scan_interval) => {
                    if let Err(e) = self.scan_once().await {
                        error!(error = %e, "supervisor scan failed");
                    }
                }
            }
        }
    }

    /// One scan pass over all in-flight sets.
    pub async fn scan_once(&self) -> NexusResult<SupervisorReport> {
        let mut report = SupervisorReport::default();

        for worker_id in self.queue.workers_with_in_flight().await? {
            if self.worker_is_alive(worker_id).await? {
                continue;
            }
            report.stale_workers += 1;
            warn!(worker_id, "worker missed heartbeat, reclaiming in-flight jobs");

            for raw in self.queue.list_in_flight(worker_id).await? {
                let envelope: JobEnvelope = match serde_json::from_str(&raw) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        error!(worker_id, error = %e, "dropping unparseable in-flight entry");
                        self.queue.remove_in_flight_raw(worker_id, &raw).await?;
                        continue;
                    }
                };

                self.event_bus
                    .publish(
                        &MonitoringEvent::task(
                            MonitoringEventType::TaskStalled,
                            envelope.task_id.clone(),
                        )
                        .with_worker(worker_id)
                        .with_retry_count(envelope.retry_count),
                    )
                    .await;

                self.queue.remove_in_flight_raw(worker_id, &raw).await?;
                let mut retried = envelope.clone();
                retried.retry_count += 1;

                if retried.retry_count >= MAX_RETRIES {
                    self.queue.dead_letter(&retried).await?;
                    report.dead_lettered += 1;
                    self.event_bus
                        .publish(
                            &MonitoringEvent::task(
                                MonitoringEventType::TaskFailed,
                                retried.task_id.clone(),
                            )
                            .with_worker(worker_id)
                            .with_retry_count(retried.retry_count)
                            .with_status("failed")
                            .with_error(format!(
                                "dead-lettered after {} retries",
                                retried.retry_count
                            ))
                            .with_meta(serde_json::json!({"error_category": "dead_letter"})),
                        )
                        .await;
                } else {
                    self.queue.requeue_front(&retried).await?;
                    report.requeued += 1;
                    self.event_bus
                        .publish(
                            &MonitoringEvent::task(
                                MonitoringEventType::TaskRetry,
                                retried.task_id.clone(),
                            )
                            .with_worker(worker_id)
                            .with_retry_count(retried.retry_count),
                        )
                        .await;
                }
            }
        }

        Ok(report)
    }

    async fn worker_is_alive(&self, worker_id: u32) -> NexusResult<bool> {
        match self.queue.get_heartbeat(worker_id).await? {
            Some(heartbeat) => {
                let age = Utc::now().signed_duration_since(heartbeat.last_seen);
                Ok(age.to_std().unwrap_or(Duration::ZERO) <= self.stale_after)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_shared::config::MonitoringConfig;
    use nexus_shared::pubsub::PubSubProvider;
    use nexus_shared::types::{Priority, WorkerHeartbeat};

    fn harness() -> (QueueSupervisor, WorkQueueProvider, PubSubProvider) {
        let queue = WorkQueueProvider::new_in_memory();
        let pubsub = PubSubProvider::new_in_memory();
        let event_bus = EventBus::new(pubsub.clone(), MonitoringConfig::default());
        let supervisor =
            QueueSupervisor::new(queue.clone(), event_bus, Duration::from_secs(10));
        (supervisor, queue, pubsub)
    }

    async fn pop_for_worker(queue: &WorkQueueProvider, worker_id: u32) -> JobEnvelope {
        queue
            .blocking_pop(worker_id, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_alive_worker_keeps_its_jobs() {
        let (supervisor, queue, _) = harness();
        let job = JobEnvelope::new("t1", "a", "b", Priority::Normal);
        queue.enqueue(&job).await.unwrap();
        pop_for_worker(&queue, 1).await;
        queue
            .set_heartbeat(&WorkerHeartbeat::active(1, Some("t1".to_string())))
            .await
            .unwrap();

        let report = supervisor.scan_once().await.unwrap();
        assert_eq!(report, SupervisorReport::default());
        assert_eq!(queue.list_in_flight(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dead_worker_jobs_are_requeued_to_head_with_retry_bump() {
        let (supervisor, queue, pubsub) = harness();
        let mut events = pubsub
            .subscribe(&["nexus:events".to_string()])
            .await
            .unwrap();

        queue
            .enqueue(&JobEnvelope::new("t1", "a", "b", Priority::Normal))
            .await
            .unwrap();
        pop_for_worker(&queue, 9).await;
        // No heartbeat for worker 9 at all

        let report = supervisor.scan_once().await.unwrap();
        assert_eq!(report.stale_workers, 1);
        assert_eq!(report.requeued, 1);
        assert_eq!(report.dead_lettered, 0);

        // Job is back at the head of its tier with retry_count = 1
        let retried = pop_for_worker(&queue, 2).await;
        assert_eq!(retried.task_id, "t1");
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.priority, Priority::Normal);

        // task_stalled then task_retry on the monitoring stream
        let (_, first) = events.recv().await.unwrap();
        assert!(first.contains("task_stalled"));
        let (_, second) = events.recv().await.unwrap();
        assert!(second.contains("task_retry"));
        assert!(second.contains("\"retry_count\":1"));
    }

    #[tokio::test]
    async fn test_stale_heartbeat_counts_as_dead() {
        let (supervisor, queue, _) = harness();
        queue
            .enqueue(&JobEnvelope::new("t1", "a", "b", Priority::High))
            .await
            .unwrap();
        pop_for_worker(&queue, 3).await;

        // Heartbeat exists but is older than 2× the interval
        let mut heartbeat = WorkerHeartbeat::active(3, Some("t1".to_string()));
        heartbeat.last_seen = Utc::now() - chrono::Duration::seconds(60);
        queue.set_heartbeat(&heartbeat).await.unwrap();

        let report = supervisor.scan_once().await.unwrap();
        assert_eq!(report.requeued, 1);
    }

    #[tokio::test]
    async fn test_retry_ceiling_moves_job_to_dead_letter() {
        let (supervisor, queue, pubsub) = harness();
        let mut events = pubsub
            .subscribe(&["nexus:events".to_string()])
            .await
            .unwrap();

        let mut job = JobEnvelope::new("doomed", "a", "b", Priority::Low);
        job.retry_count = 4;
        queue.enqueue(&job).await.unwrap();
        pop_for_worker(&queue, 5).await;

        let report = supervisor.scan_once().await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.requeued, 0);
        assert_eq!(queue.dead_letter_depth().await.unwrap(), 1);
        assert_eq!(queue.queue_depths().await.unwrap().total(), 0);

        let letters = queue.list_dead_letters().await.unwrap();
        assert_eq!(letters[0].retry_count, 5);

        // task_stalled then task_failed with the dead_letter category
        let (_, first) = events.recv().await.unwrap();
        assert!(first.contains("task_stalled"));
        let (_, second) = events.recv().await.unwrap();
        assert!(second.contains("task_failed"));
        assert!(second.contains("\"error_category\":\"dead_letter\""));
    }

    #[tokio::test]
    async fn test_second_scan_is_a_noop_after_reclaim() {
        let (supervisor, queue, _) = harness();
        queue
            .enqueue(&JobEnvelope::new("t1", "a", "b", Priority::Normal))
            .await
            .unwrap();
        pop_for_worker(&queue, 6).await;

        let first = supervisor.scan_once().await.unwrap();
        assert_eq!(first.requeued, 1);

        // The job now sits in the queue again; worker 6 holds nothing
        let second = supervisor.scan_once().await.unwrap();
        assert_eq!(second, SupervisorReport::default());
    }
}
