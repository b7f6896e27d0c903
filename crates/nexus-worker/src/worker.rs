//! # Research Worker
//!
//! Long-running consumer with a stable integer id. Pops one job at a
//! time, ensures the task row exists, and drives the task through the
//! pipeline. Heartbeats refresh on every loop iteration; a
//! `worker_heartbeat` event is additionally emitted on the configured
//! cadence. On a termination signal the worker stops accepting jobs,
//! lets the in-flight task finish, and exits.
//!
//! Failure handling: a pipeline failure bumps the envelope's retry count
//! and re-enqueues it until the dead-letter ceiling, at which point the
//! task is terminally failed with the `dead_letter` category. The error
//! is recorded durably on the task row either way.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use nexus_agents::{AgentContext, AgentRegistry, AgentSpawner};
use nexus_orchestration::continuous::ContinuousScheduler;
use nexus_orchestration::context::SystemContext;
use nexus_orchestration::pipeline::{PipelineConfig, ResearchPipeline};
use nexus_queue::{QueueClient, MAX_RETRIES};
use nexus_shared::llm::LlmClient;
use nexus_shared::messaging::AgentBus;
use nexus_shared::monitoring::{MonitoringEvent, MonitoringEventType};
use nexus_shared::resilience::{CircuitBreaker, CircuitBreakerConfig};
use nexus_shared::types::{JobEnvelope, TaskStatus, WorkerHeartbeat};
use nexus_shared::NexusResult;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: u32,
    /// Deadline for each queue pop
    pub pop_timeout: Duration,
    /// Cadence for `worker_heartbeat` events
    pub heartbeat_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: std::process::id(),
            pop_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

pub struct ResearchWorker {
    ctx: Arc<SystemContext>,
    agent_ctx: Arc<AgentContext>,
    /// Breaker-protected view of the shared work queue
    queue: QueueClient,
    spawner: AgentSpawner,
    pipeline: ResearchPipeline,
    scheduler: ContinuousScheduler,
    config: WorkerConfig,
}

impl std::fmt::Debug for ResearchWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResearchWorker")
            .field("worker_id", &self.config.worker_id)
            .finish()
    }
}

impl ResearchWorker {
    /// Wire up the per-worker fabric: a fresh in-process bus, the agent
    /// set for every enabled provider, and the pipeline over them.
    pub fn new(ctx: Arc<SystemContext>, llm: Arc<LlmClient>, config: WorkerConfig) -> NexusResult<Self> {
        let bus = AgentBus::new();
        bus.connect();

        let agent_ctx = Arc::new(AgentContext::new(
            bus,
            llm,
            ctx.store.clone(),
            ctx.config.storage_path.clone().into(),
            ctx.config.search_providers.clone(),
        ));
        Self::with_agent_context(ctx, agent_ctx, config)
    }

    /// Build the worker around an existing agent context (tests inject
    /// scripted adapters this way). The context's store must be the same
    /// backend the system context uses.
    pub fn with_agent_context(
        ctx: Arc<SystemContext>,
        agent_ctx: Arc<AgentContext>,
        config: WorkerConfig,
    ) -> NexusResult<Self> {
        let mut provider_names: Vec<String> =
            agent_ctx.search_adapters.keys().cloned().collect();
        provider_names.sort();

        let registry = AgentRegistry::with_defaults(&provider_names);
        let spawner = AgentSpawner::new(agent_ctx.clone());
        spawner.spawn_all(&registry)?;

        let pipeline = ResearchPipeline::new(
            ctx.store.clone(),
            agent_ctx.bus.clone(),
            ctx.event_bus.clone(),
            config.worker_id,
            PipelineConfig {
                search_providers: provider_names,
                ..Default::default()
            },
        );

        let scheduler = ContinuousScheduler::new(ctx.queue.clone(), ctx.event_bus.clone());
        let breaker = Arc::new(CircuitBreaker::new(
            "work-queue",
            CircuitBreakerConfig::default(),
        ));
        let queue = QueueClient::with_circuit_breaker(ctx.queue.clone(), breaker);

        Ok(Self {
            ctx,
            agent_ctx,
            queue,
            spawner,
            pipeline,
            scheduler,
            config,
        })
    }

    pub fn worker_id(&self) -> u32 {
        self.config.worker_id
    }

    /// Main loop. Returns when `shutdown` is cancelled; an in-flight task
    /// runs to completion first.
    pub async fn run(&self, shutdown: CancellationToken) -> NexusResult<()> {
        let worker_id = self.config.worker_id;
        info!(worker_id, "worker starting");

        self.heartbeat(None).await;
        self.ctx
            .event_bus
            .publish(&MonitoringEvent::worker(
                MonitoringEventType::WorkerStarted,
                worker_id,
            ))
            .await;

        let scheduler_handle = tokio::spawn(self.scheduler.clone().run(shutdown.clone()));
        let mut last_heartbeat_event = Instant::now();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            self.heartbeat(None).await;
            if last_heartbeat_event.elapsed() >= self.config.heartbeat_interval {
                self.ctx
                    .event_bus
                    .publish(
                        &MonitoringEvent::worker(MonitoringEventType::WorkerHeartbeat, worker_id)
                            .with_status("active"),
                    )
                    .await;
                last_heartbeat_event = Instant::now();
            }

            let popped = tokio::select! {
                _ = shutdown.cancelled() => break,
                popped = self.queue.blocking_pop(worker_id, self.config.pop_timeout) => popped,
            };

            match popped {
                Ok(Some(job)) => {
                    if let Err(e) = self.process_job(job).await {
                        error!(worker_id, error = %e, "job processing failed internally");
                    }
                }
                Ok(None) => continue, // queue idle
                Err(e) => {
                    warn!(worker_id, error = %e, "queue pop failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        // Flush in-flight state and announce the stop
        self.spawner.stop_all();
        self.agent_ctx.bus.disconnect();
        let _ = self.ctx.queue.clear_heartbeat(worker_id).await;
        self.ctx
            .event_bus
            .publish(&MonitoringEvent::worker(
                MonitoringEventType::WorkerStopped,
                worker_id,
            ))
            .await;
        scheduler_handle.abort();
        info!(worker_id, "worker stopped");
        Ok(())
    }

    /// Handle one popped job end to end. At-least-once delivery means a
    /// task id can arrive twice; a terminal task row makes this a no-op.
    async fn process_job(&self, job: JobEnvelope) -> NexusResult<()> {
        let worker_id = self.config.worker_id;
        let started = Instant::now();
        info!(worker_id, task_id = %job.task_id, retry = job.retry_count, "processing task");

        self.heartbeat(Some(job.task_id.clone())).await;

        let task = self.ctx.store.ensure_task_from_envelope(&job).await?;
        if task.status.is_terminal() {
            info!(task_id = %task.task_id, status = %task.status, "duplicate delivery of terminal task, dropping");
            self.queue.complete(worker_id, &job).await?;
            return Ok(());
        }

        self.ctx
            .event_bus
            .publish(
                &MonitoringEvent::task(MonitoringEventType::TaskStarted, job.task_id.clone())
                    .with_worker(worker_id)
                    .with_retry_count(job.retry_count),
            )
            .await;

        self.ctx
            .store
            .update_task_status(&task.task_id, TaskStatus::Planning)
            .await?;
        self.publish_status_update(&task.task_id, TaskStatus::Planning).await;

        match self.pipeline.run(&task).await {
            Ok(outcome) => {
                self.ctx
                    .store
                    .complete_task(
                        &task.task_id,
                        Some(outcome.results),
                        Some(outcome.summary),
                        Some(outcome.reasoning),
                    )
                    .await?;
                self.queue.complete(worker_id, &job).await?;
                self.publish_status_update(&task.task_id, TaskStatus::Completed).await;
                self.ctx
                    .event_bus
                    .publish(
                        &MonitoringEvent::task(
                            MonitoringEventType::TaskCompleted,
                            job.task_id.clone(),
                        )
                        .with_worker(worker_id)
                        .with_status("completed")
                        .with_duration_ms(started.elapsed().as_millis() as u64),
                    )
                    .await;
                info!(worker_id, task_id = %job.task_id, "task completed");

                if job.continuous_mode {
                    self.scheduler.schedule_next_run(&job);
                }
            }
            Err(pipeline_error) => {
                warn!(worker_id, task_id = %job.task_id, error = %pipeline_error, "pipeline failed");
                self.ctx
                    .store
                    .record_task_error(&task.task_id, &pipeline_error.to_string())
                    .await?;
                self.queue.complete(worker_id, &job).await?;

                let mut retried = job.clone();
                retried.retry_count += 1;

                if retried.retry_count >= MAX_RETRIES {
                    self.ctx
                        .store
                        .fail_task(&task.task_id, &pipeline_error.to_string(), "dead_letter")
                        .await?;
                    self.ctx.queue.dead_letter(&retried).await?;
                    self.publish_status_update(&task.task_id, TaskStatus::Failed).await;
                    self.ctx
                        .event_bus
                        .publish(
                            &MonitoringEvent::task(
                                MonitoringEventType::TaskFailed,
                                job.task_id.clone(),
                            )
                            .with_worker(worker_id)
                            .with_status("failed")
                            .with_retry_count(retried.retry_count)
                            .with_error(pipeline_error.to_string())
                            .with_meta(serde_json::json!({"error_category": "dead_letter"})),
                        )
                        .await;
                } else {
                    self.queue.enqueue(&retried).await?;
                    self.ctx
                        .event_bus
                        .publish(
                            &MonitoringEvent::task(
                                MonitoringEventType::TaskRetry,
                                job.task_id.clone(),
                            )
                            .with_worker(worker_id)
                            .with_retry_count(retried.retry_count)
                            .with_error(pipeline_error.to_string()),
                        )
                        .await;
                }
            }
        }

        self.heartbeat(None).await;
        Ok(())
    }

    async fn heartbeat(&self, current_task_id: Option<String>) {
        let heartbeat = WorkerHeartbeat::active(self.config.worker_id, current_task_id);
        if let Err(e) = self.queue.set_heartbeat(&heartbeat).await {
            warn!(worker_id = self.config.worker_id, error = %e, "heartbeat write failed");
        }
    }

    /// Per-task status channel for observers following one task.
    async fn publish_status_update(&self, task_id: &str, status: TaskStatus) {
        let channel = self.ctx.key_router.task_status_channel(task_id);
        let payload = serde_json::json!({
            "task_id": task_id,
            "status": status,
            "worker_id": self.config.worker_id,
            "timestamp": chrono::Utc::now(),
        });
        if let Err(e) = self.ctx.pubsub.publish(&channel, &payload.to_string()).await {
            warn!(task_id, error = %e, "task status publish failed");
        }
    }
}
