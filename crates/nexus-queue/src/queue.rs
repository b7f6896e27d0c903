//! # Work Queue
//!
//! Priority FIFO with reliable pop: three tiers scanned high → normal →
//! low, an atomic pop-and-move into per-worker in-flight sets, requeue on
//! worker failure, and a dead-letter list once the retry budget is spent.
//! Delivery is at-least-once; consumers are idempotent with respect to
//! duplicate delivery of the same task id.
//!
//! Two providers behind one enum, mirroring the pub/sub layer: `Redis` for
//! production and `InMemory` for tests. No trait objects.

use std::sync::Arc;
use std::time::{Duration, Instant};

use nexus_shared::resilience::CircuitBreaker;
use nexus_shared::types::{JobEnvelope, QueueDepths, WorkerHeartbeat};
use nexus_shared::{NexusError, NexusResult};

use crate::providers::{InMemoryWorkQueue, RedisWorkQueue};
use crate::router::KeyRouter;

/// Work-queue backend, enum-dispatched.
#[derive(Debug, Clone)]
pub enum WorkQueueProvider {
    Redis(RedisWorkQueue),
    InMemory(InMemoryWorkQueue),
}

impl WorkQueueProvider {
    pub fn new_in_memory() -> Self {
        Self::InMemory(InMemoryWorkQueue::new())
    }

    pub async fn connect_redis(redis_url: &str, router: KeyRouter) -> NexusResult<Self> {
        Ok(Self::Redis(RedisWorkQueue::connect(redis_url, router).await?))
    }

    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::Redis(_) => "redis",
            Self::InMemory(_) => "in_memory",
        }
    }

    /// Append a job to the tail of its priority tier.
    pub async fn enqueue(&self, job: &JobEnvelope) -> NexusResult<()> {
        match self {
            Self::Redis(q) => q.enqueue(job).await,
            Self::InMemory(q) => q.enqueue(job),
        }
    }

    /// Pop the next job, atomically moving it into the worker's in-flight
    /// set. Scans high → normal → low under one combined deadline; `None`
    /// on timeout.
    pub async fn blocking_pop(
        &self,
        worker_id: u32,
        timeout: Duration,
    ) -> NexusResult<Option<JobEnvelope>> {
        match self {
            Self::Redis(q) => q.blocking_pop(worker_id, timeout).await,
            Self::InMemory(q) => q.blocking_pop(worker_id, timeout).await,
        }
    }

    /// Idempotently re-assert in-flight membership for a popped job.
    pub async fn mark_in_flight(&self, worker_id: u32, job: &JobEnvelope) -> NexusResult<()> {
        match self {
            Self::Redis(q) => q.mark_in_flight(worker_id, job).await,
            Self::InMemory(q) => q.mark_in_flight(worker_id, job),
        }
    }

    /// Drop a finished job from the worker's in-flight set.
    pub async fn complete(&self, worker_id: u32, job: &JobEnvelope) -> NexusResult<()> {
        match self {
            Self::Redis(q) => q.complete(worker_id, job).await,
            Self::InMemory(q) => q.complete(worker_id, job),
        }
    }

    /// Push a job back to the **head** of its priority tier.
    pub async fn requeue_front(&self, job: &JobEnvelope) -> NexusResult<()> {
        match self {
            Self::Redis(q) => q.requeue_front(job).await,
            Self::InMemory(q) => q.requeue_front(job),
        }
    }

    /// Move a job to the dead-letter list.
    pub async fn dead_letter(&self, job: &JobEnvelope) -> NexusResult<()> {
        match self {
            Self::Redis(q) => q.dead_letter(job).await,
            Self::InMemory(q) => q.dead_letter(job),
        }
    }

    /// Raw serialized members of a worker's in-flight set.
    pub async fn list_in_flight(&self, worker_id: u32) -> NexusResult<Vec<String>> {
        match self {
            Self::Redis(q) => q.list_in_flight(worker_id).await,
            Self::InMemory(q) => Ok(q.list_in_flight(worker_id)),
        }
    }

    /// Remove one raw member from a worker's in-flight set.
    pub async fn remove_in_flight_raw(&self, worker_id: u32, raw: &str) -> NexusResult<()> {
        match self {
            Self::Redis(q) => q.remove_in_flight_raw(worker_id, raw).await,
            Self::InMemory(q) => {
                q.remove_in_flight_raw(worker_id, raw);
                Ok(())
            }
        }
    }

    /// Ids of workers that currently hold in-flight jobs.
    pub async fn workers_with_in_flight(&self) -> NexusResult<Vec<u32>> {
        match self {
            Self::Redis(q) => q.workers_with_in_flight().await,
            Self::InMemory(q) => Ok(q.workers_with_in_flight()),
        }
    }

    pub async fn queue_depths(&self) -> NexusResult<QueueDepths> {
        match self {
            Self::Redis(q) => q.queue_depths().await,
            Self::InMemory(q) => Ok(q.queue_depths()),
        }
    }

    pub async fn dead_letter_depth(&self) -> NexusResult<u64> {
        match self {
            Self::Redis(q) => q.dead_letter_depth().await,
            Self::InMemory(q) => Ok(q.dead_letter_depth()),
        }
    }

    pub async fn list_dead_letters(&self) -> NexusResult<Vec<JobEnvelope>> {
        match self {
            Self::Redis(q) => q.list_dead_letters().await,
            Self::InMemory(q) => q.list_dead_letters(),
        }
    }

    /// Publish a worker heartbeat (30 s TTL).
    pub async fn set_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> NexusResult<()> {
        match self {
            Self::Redis(q) => q.set_heartbeat(heartbeat).await,
            Self::InMemory(q) => {
                q.set_heartbeat(heartbeat);
                Ok(())
            }
        }
    }

    pub async fn get_heartbeat(&self, worker_id: u32) -> NexusResult<Option<WorkerHeartbeat>> {
        match self {
            Self::Redis(q) => q.get_heartbeat(worker_id).await,
            Self::InMemory(q) => Ok(q.get_heartbeat(worker_id)),
        }
    }

    pub async fn clear_heartbeat(&self, worker_id: u32) -> NexusResult<()> {
        match self {
            Self::Redis(q) => q.clear_heartbeat(worker_id).await,
            Self::InMemory(q) => {
                q.clear_heartbeat(worker_id);
                Ok(())
            }
        }
    }

    pub async fn workers_online(&self) -> NexusResult<u32> {
        match self {
            Self::Redis(q) => q.workers_online().await,
            Self::InMemory(q) => Ok(q.workers_online()),
        }
    }

    /// Delete every queue-owned key. Refuses without the literal
    /// confirmation token.
    pub async fn purge(&self, confirmation_token: &str) -> NexusResult<()> {
        if confirmation_token != crate::PURGE_CONFIRMATION_TOKEN {
            return Err(NexusError::ConfirmationRequired("queue purge".to_string()));
        }
        match self {
            Self::Redis(q) => q.purge().await,
            Self::InMemory(q) => {
                q.purge();
                Ok(())
            }
        }
    }
}

/// Work-queue client: the provider plus an optional circuit breaker
/// guarding the pop/enqueue hot path.
#[derive(Debug, Clone)]
pub struct QueueClient {
    provider: WorkQueueProvider,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
}

impl QueueClient {
    pub fn new(provider: WorkQueueProvider) -> Self {
        Self {
            provider,
            circuit_breaker: None,
        }
    }

    pub fn with_circuit_breaker(
        provider: WorkQueueProvider,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            provider,
            circuit_breaker: Some(circuit_breaker),
        }
    }

    pub fn provider(&self) -> &WorkQueueProvider {
        &self.provider
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.circuit_breaker.as_ref()
    }

    fn gate(&self) -> NexusResult<()> {
        if let Some(cb) = &self.circuit_breaker {
            if !cb.should_allow() {
                return Err(NexusError::CircuitOpen(cb.name().to_string()));
            }
        }
        Ok(())
    }

    fn record<T>(&self, started: Instant, result: &NexusResult<T>) {
        if let Some(cb) = &self.circuit_breaker {
            match result {
                Ok(_) => cb.record_success(started.elapsed()),
                Err(_) => cb.record_failure(started.elapsed()),
            }
        }
    }

    /// Enqueue with breaker protection.
    pub async fn enqueue(&self, job: &JobEnvelope) -> NexusResult<()> {
        self.gate()?;
        let started = Instant::now();
        let result = self.provider.enqueue(job).await;
        self.record(started, &result);
        result
    }

    /// Blocking pop with breaker protection.
    pub async fn blocking_pop(
        &self,
        worker_id: u32,
        timeout: Duration,
    ) -> NexusResult<Option<JobEnvelope>> {
        self.gate()?;
        let started = Instant::now();
        let result = self.provider.blocking_pop(worker_id, timeout).await;
        self.record(started, &result);
        result
    }

    /// Completion bypasses the breaker: failing to ack only causes
    /// redelivery, and must stay possible while the breaker is open.
    pub async fn complete(&self, worker_id: u32, job: &JobEnvelope) -> NexusResult<()> {
        self.provider.complete(worker_id, job).await
    }

    /// Heartbeats bypass the breaker for the same reason.
    pub async fn set_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> NexusResult<()> {
        self.provider.set_heartbeat(heartbeat).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_shared::resilience::CircuitBreakerConfig;
    use nexus_shared::types::Priority;

    fn job(id: &str, priority: Priority) -> JobEnvelope {
        JobEnvelope::new(id, format!("title-{id}"), format!("desc-{id}"), priority)
    }

    #[tokio::test]
    async fn test_enqueue_pop_round_trip_is_byte_identical() {
        let queue = WorkQueueProvider::new_in_memory();
        let original = job("t1", Priority::Normal);
        queue.enqueue(&original).await.unwrap();

        let popped = queue
            .blocking_pop(1, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped, original);
        assert_eq!(
            serde_json::to_vec(&popped).unwrap(),
            serde_json::to_vec(&original).unwrap()
        );
    }

    #[tokio::test]
    async fn test_pop_scans_high_before_normal_before_low() {
        let queue = WorkQueueProvider::new_in_memory();
        queue.enqueue(&job("low", Priority::Low)).await.unwrap();
        queue.enqueue(&job("normal", Priority::Normal)).await.unwrap();
        queue.enqueue(&job("high", Priority::High)).await.unwrap();

        let mut order = Vec::new();
        for _ in 0..3 {
            let popped = queue
                .blocking_pop(1, Duration::from_millis(50))
                .await
                .unwrap()
                .unwrap();
            order.push(popped.task_id);
        }

        assert_eq!(order, vec!["high", "normal", "low"]);
    }

    #[tokio::test]
    async fn test_pop_moves_job_to_in_flight_atomically() {
        let queue = WorkQueueProvider::new_in_memory();
        let envelope = job("t1", Priority::High);
        queue.enqueue(&envelope).await.unwrap();

        let popped = queue
            .blocking_pop(7, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();

        // Task id lives in exactly one place: worker 7's in-flight set
        assert_eq!(queue.queue_depths().await.unwrap().total(), 0);
        let in_flight = queue.list_in_flight(7).await.unwrap();
        assert_eq!(in_flight.len(), 1);
        assert!(in_flight[0].contains("\"t1\""));

        queue.complete(7, &popped).await.unwrap();
        assert!(queue.list_in_flight(7).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pop_timeout_returns_none() {
        let queue = WorkQueueProvider::new_in_memory();
        let started = Instant::now();
        let result = queue
            .blocking_pop(1, Duration::from_millis(80))
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_blocking_pop_wakes_on_enqueue() {
        let queue = WorkQueueProvider::new_in_memory();
        let popper = queue.clone();
        let handle = tokio::spawn(async move {
            popper.blocking_pop(1, Duration::from_secs(5)).await.unwrap()
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        queue.enqueue(&job("late", Priority::Normal)).await.unwrap();

        let popped = handle.await.unwrap().unwrap();
        assert_eq!(popped.task_id, "late");
    }

    #[tokio::test]
    async fn test_requeue_front_preserves_tier_and_goes_first() {
        let queue = WorkQueueProvider::new_in_memory();
        queue.enqueue(&job("t1", Priority::Normal)).await.unwrap();
        let mut stalled = job("stalled", Priority::Normal);
        stalled.retry_count = 1;
        queue.requeue_front(&stalled).await.unwrap();

        let first = queue
            .blocking_pop(1, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.task_id, "stalled");
        assert_eq!(first.retry_count, 1);
    }

    #[tokio::test]
    async fn test_dead_letter_list() {
        let queue = WorkQueueProvider::new_in_memory();
        let mut doomed = job("t1", Priority::Low);
        doomed.retry_count = 5;
        queue.dead_letter(&doomed).await.unwrap();

        assert_eq!(queue.dead_letter_depth().await.unwrap(), 1);
        let letters = queue.list_dead_letters().await.unwrap();
        assert_eq!(letters[0].task_id, "t1");
        assert_eq!(letters[0].retry_count, 5);
    }

    #[tokio::test]
    async fn test_queue_depths() {
        let queue = WorkQueueProvider::new_in_memory();
        queue.enqueue(&job("a", Priority::High)).await.unwrap();
        queue.enqueue(&job("b", Priority::Normal)).await.unwrap();
        queue.enqueue(&job("c", Priority::Normal)).await.unwrap();

        let depths = queue.queue_depths().await.unwrap();
        assert_eq!(depths.high_priority, 1);
        assert_eq!(depths.normal_priority, 2);
        assert_eq!(depths.low_priority, 0);
        assert_eq!(depths.total(), 3);
    }

    #[tokio::test]
    async fn test_heartbeats_and_workers_online() {
        let queue = WorkQueueProvider::new_in_memory();
        assert_eq!(queue.workers_online().await.unwrap(), 0);

        queue
            .set_heartbeat(&WorkerHeartbeat::active(1, None))
            .await
            .unwrap();
        queue
            .set_heartbeat(&WorkerHeartbeat::active(2, Some("t1".to_string())))
            .await
            .unwrap();

        assert_eq!(queue.workers_online().await.unwrap(), 2);
        let hb = queue.get_heartbeat(2).await.unwrap().unwrap();
        assert_eq!(hb.current_task_id.as_deref(), Some("t1"));

        queue.clear_heartbeat(2).await.unwrap();
        assert_eq!(queue.workers_online().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_purge_requires_confirmation_token() {
        let queue = WorkQueueProvider::new_in_memory();
        queue.enqueue(&job("t1", Priority::Normal)).await.unwrap();

        assert!(queue.purge("nope").await.is_err());
        assert_eq!(queue.queue_depths().await.unwrap().total(), 1);

        queue.purge(crate::PURGE_CONFIRMATION_TOKEN).await.unwrap();
        assert_eq!(queue.queue_depths().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_client_breaker_blocks_enqueue_when_open() {
        let breaker = Arc::new(CircuitBreaker::new(
            "queue",
            CircuitBreakerConfig::default(),
        ));
        let client =
            QueueClient::with_circuit_breaker(WorkQueueProvider::new_in_memory(), breaker.clone());

        breaker.force_open();
        let result = client.enqueue(&job("t1", Priority::Normal)).await;
        assert!(matches!(result, Err(NexusError::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn test_client_complete_bypasses_breaker() {
        let breaker = Arc::new(CircuitBreaker::new(
            "queue",
            CircuitBreakerConfig::default(),
        ));
        let client =
            QueueClient::with_circuit_breaker(WorkQueueProvider::new_in_memory(), breaker.clone());

        let envelope = job("t1", Priority::Normal);
        client.enqueue(&envelope).await.unwrap();
        let popped = client
            .blocking_pop(1, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();

        breaker.force_open();
        assert!(client.complete(1, &popped).await.is_ok());
        assert!(client
            .set_heartbeat(&WorkerHeartbeat::active(1, None))
            .await
            .is_ok());
    }
}
