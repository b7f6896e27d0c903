//! Queue integration tests against a real Redis:
//!
//! ```bash
//! REDIS_URL=redis://localhost:6379/15 cargo test --features test-redis
//! ```
//!
//! Uses a scratch database index; every test starts from a purged
//! keyspace.

#![cfg(feature = "test-redis")]

use std::time::Duration;

use serial_test::serial;

use nexus_queue::{KeyRouter, QueueSupervisor, WorkQueueProvider, PURGE_CONFIRMATION_TOKEN};
use nexus_shared::config::MonitoringConfig;
use nexus_shared::monitoring::EventBus;
use nexus_shared::pubsub::PubSubProvider;
use nexus_shared::types::{JobEnvelope, Priority, WorkerHeartbeat};

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379/15".to_string())
}

async fn queue() -> WorkQueueProvider {
    let provider = WorkQueueProvider::connect_redis(&redis_url(), KeyRouter::default())
        .await
        .expect("redis reachable");
    provider.purge(PURGE_CONFIRMATION_TOKEN).await.unwrap();
    provider
}

#[tokio::test]
#[serial]
async fn test_enqueue_pop_round_trip_is_byte_identical() {
    let queue = queue().await;
    let job = JobEnvelope::new("t1", "AI in Healthcare", "Impact of AI", Priority::High);
    queue.enqueue(&job).await.unwrap();

    let popped = queue
        .blocking_pop(1, Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(popped, job);
    assert_eq!(
        serde_json::to_vec(&popped).unwrap(),
        serde_json::to_vec(&job).unwrap()
    );
    queue.complete(1, &popped).await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_atomic_pop_moves_to_in_flight() {
    let queue = queue().await;
    queue
        .enqueue(&JobEnvelope::new("t1", "a", "b", Priority::Normal))
        .await
        .unwrap();

    queue
        .blocking_pop(7, Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(queue.queue_depths().await.unwrap().total(), 0);
    assert_eq!(queue.list_in_flight(7).await.unwrap().len(), 1);
    assert_eq!(queue.workers_with_in_flight().await.unwrap(), vec![7]);
}

#[tokio::test]
#[serial]
async fn test_priority_scan_order_over_redis() {
    let queue = queue().await;
    queue
        .enqueue(&JobEnvelope::new("low", "a", "b", Priority::Low))
        .await
        .unwrap();
    queue
        .enqueue(&JobEnvelope::new("high", "a", "b", Priority::High))
        .await
        .unwrap();

    let first = queue
        .blocking_pop(1, Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.task_id, "high");
}

#[tokio::test]
#[serial]
async fn test_heartbeat_round_trip_and_online_count() {
    let queue = queue().await;
    queue
        .set_heartbeat(&WorkerHeartbeat::active(3, Some("t1".to_string())))
        .await
        .unwrap();

    let heartbeat = queue.get_heartbeat(3).await.unwrap().unwrap();
    assert_eq!(heartbeat.current_task_id.as_deref(), Some("t1"));
    assert_eq!(queue.workers_online().await.unwrap(), 1);

    queue.clear_heartbeat(3).await.unwrap();
    assert_eq!(queue.workers_online().await.unwrap(), 0);
}

/// The wall-clock variant of the crashed-worker scenario: a worker pops a
/// job, never heartbeats, and the supervisor reclaims the job once the
/// staleness horizon passes.
#[tokio::test]
#[serial]
async fn test_supervisor_reclaims_job_from_silent_worker() {
    let queue = queue().await;
    let pubsub = PubSubProvider::connect_redis(&redis_url()).await.unwrap();
    let mut events = pubsub
        .subscribe(&["nexus:events".to_string()])
        .await
        .unwrap();
    let event_bus = EventBus::new(pubsub.clone(), MonitoringConfig::default());

    queue
        .enqueue(&JobEnvelope::new("t1", "a", "b", Priority::Normal))
        .await
        .unwrap();
    queue
        .blocking_pop(99, Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();

    // Short heartbeat interval keeps the wall-clock wait tolerable
    let supervisor = QueueSupervisor::new(queue.clone(), event_bus, Duration::from_millis(200));
    let report = supervisor.scan_once().await.unwrap();
    assert_eq!(report.stale_workers, 1);
    assert_eq!(report.requeued, 1);

    // The retried envelope is back at the head of its tier
    let retried = queue
        .blocking_pop(2, Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(retried.task_id, "t1");
    assert_eq!(retried.retry_count, 1);

    // task_stalled then task_retry were published
    let (_, first) = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(first.contains("task_stalled"));
    let (_, second) = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(second.contains("task_retry"));
}

#[tokio::test]
#[serial]
async fn test_redis_pubsub_round_trip() {
    let pubsub = PubSubProvider::connect_redis(&redis_url()).await.unwrap();
    let mut stream = pubsub
        .subscribe(&["nexus:events:test".to_string()])
        .await
        .unwrap();

    // Subscription setup races the first publish; retry briefly
    for _ in 0..10 {
        pubsub.publish("nexus:events:test", "ping").await.unwrap();
        if let Ok(Some((channel, payload))) =
            tokio::time::timeout(Duration::from_millis(200), stream.recv()).await
        {
            assert_eq!(channel, "nexus:events:test");
            assert_eq!(payload, "ping");
            return;
        }
    }
    panic!("no pub/sub message received");
}
