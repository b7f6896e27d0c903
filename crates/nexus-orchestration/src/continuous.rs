//! # Continuous-Mode Scheduler
//!
//! Tasks flagged continuous are re-enqueued after their configured
//! interval once a run completes. A small timer wheel: a min-heap of
//! deadlines drained by one background task, each firing enqueueing a
//! fresh envelope with the same task id and a bumped run counter.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use nexus_queue::WorkQueueProvider;
use nexus_shared::monitoring::{EventBus, MonitoringEvent, MonitoringEventType};
use nexus_shared::types::JobEnvelope;

#[derive(Debug)]
struct ScheduledRun {
    due: Instant,
    envelope: JobEnvelope,
}

impl PartialEq for ScheduledRun {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}
impl Eq for ScheduledRun {}
impl PartialOrd for ScheduledRun {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScheduledRun {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due)
    }
}

#[derive(Debug, Clone)]
pub struct ContinuousScheduler {
    queue: WorkQueueProvider,
    event_bus: EventBus,
    pending: Arc<Mutex<BinaryHeap<Reverse<ScheduledRun>>>>,
    changed: Arc<Notify>,
}

impl ContinuousScheduler {
    pub fn new(queue: WorkQueueProvider, event_bus: EventBus) -> Self {
        Self {
            queue,
            event_bus,
            pending: Arc::new(Mutex::new(BinaryHeap::new())),
            changed: Arc::new(Notify::new()),
        }
    }

    /// Schedule the next run of a completed continuous task.
    pub fn schedule_next_run(&self, completed: &JobEnvelope) {
        let Some(hours) = completed.continuous_interval_hours else {
            return;
        };
        self.schedule_after(completed, Duration::from_secs(u64::from(hours) * 3600));
    }

    /// Schedule a fresh envelope (same task id, bumped run counter) after
    /// a delay.
    pub fn schedule_after(&self, completed: &JobEnvelope, delay: Duration) {
        let next = completed.next_run();
        info!(
            task_id = %next.task_id,
            run = next.run_counter,
            delay_secs = delay.as_secs(),
            "continuous run scheduled"
        );
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Reverse(ScheduledRun {
                due: Instant::now() + delay,
                envelope: next,
            }));
        self.changed.notify_waiters();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn pop_due(&self) -> (Vec<JobEnvelope>, Option<Instant>) {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        let mut due = Vec::new();
        while let Some(Reverse(head)) = pending.peek() {
            if head.due <= now {
                due.push(pending.pop().expect("peeked entry").0.envelope);
            } else {
                break;
            }
        }
        let next_due = pending.peek().map(|Reverse(run)| run.due);
        (due, next_due)
    }

    /// Drain the wheel until cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!("continuous scheduler started");
        loop {
            let (due, next_due) = self.pop_due();
            for envelope in due {
                if let Err(e) = self.queue.enqueue(&envelope).await {
                    error!(task_id = %envelope.task_id, error = %e, "continuous re-enqueue failed");
                    continue;
                }
                self.event_bus
                    .publish(
                        &MonitoringEvent::task(
                            MonitoringEventType::TaskEnqueued,
                            envelope.task_id.clone(),
                        )
                        .with_meta(serde_json::json!({
                            "continuous": true,
                            "run_counter": envelope.run_counter,
                        })),
                    )
                    .await;
            }

            let sleep_for = next_due
                .map(|due| due.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_secs(60));
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("continuous scheduler stopping");
                    break;
                }
                _ = self.changed.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }
}
