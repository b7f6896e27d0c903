//! # Agent Bus
//!
//! In-process pub/sub fabric carrying [`MessageEnvelope`]s between pipeline
//! stages and agents. Agents are spawned per worker process, so the fabric
//! never needs a broker: a topic is an unbounded channel drained by one
//! receiver loop, which preserves publish order per topic.
//!
//! Each subscriber owns a private delivery queue processed sequentially by
//! its own task, so one subscriber observes envelopes in publish order and
//! a slow handler cannot block delivery to the others. Handler errors are
//! caught and logged; they never affect other subscribers.
//!
//! `wait_for_reply` is a registry of pending correlations keyed by
//! `(conversation_id, in_reply_to)` resolved directly by the receiver loop
//! through a oneshot — no temporary handler subscription to leak.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{NexusError, NexusResult};
use crate::messaging::envelope::MessageEnvelope;

/// Handler invoked for every envelope delivered on a subscribed topic.
pub type EnvelopeHandler =
    Arc<dyn Fn(MessageEnvelope) -> BoxFuture<'static, NexusResult<()>> + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Default deadline for correlated waits.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(60);

struct Waiter {
    conversation_id: Option<String>,
    in_reply_to: Option<String>,
    tx: oneshot::Sender<MessageEnvelope>,
}

impl Waiter {
    fn matches(&self, envelope: &MessageEnvelope) -> bool {
        if let Some(conversation_id) = &self.conversation_id {
            if envelope.conversation_id.as_ref() != Some(conversation_id) {
                return false;
            }
        }
        if let Some(in_reply_to) = &self.in_reply_to {
            if envelope.reply_to.as_ref() != Some(in_reply_to) {
                return false;
            }
        }
        true
    }
}

struct TopicState {
    tx: mpsc::UnboundedSender<MessageEnvelope>,
    subscribers: Arc<DashMap<u64, mpsc::UnboundedSender<MessageEnvelope>>>,
    waiters: Arc<DashMap<u64, Waiter>>,
}

struct BusInner {
    topics: DashMap<String, TopicState>,
    next_id: AtomicU64,
    connected: AtomicBool,
}

/// The in-process agent bus. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct AgentBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for AgentBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBus")
            .field("topics", &self.inner.topics.len())
            .field("connected", &self.inner.connected.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for AgentBus {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: DashMap::new(),
                next_id: AtomicU64::new(1),
                connected: AtomicBool::new(false),
            }),
        }
    }

    /// Mark the fabric live. Idempotent.
    pub fn connect(&self) {
        self.inner.connected.store(true, Ordering::SeqCst);
    }

    /// Tear down every topic loop and pending waiter.
    pub fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.topics.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> NexusResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(NexusError::Messaging("bus is not connected".to_string()))
        }
    }

    /// Get or create the state (and receiver loop) for a topic.
    fn topic_state(&self, topic: &str) -> mpsc::UnboundedSender<MessageEnvelope> {
        if let Some(state) = self.inner.topics.get(topic) {
            return state.tx.clone();
        }

        let entry = self.inner.topics.entry(topic.to_string()).or_insert_with(|| {
            let (tx, mut rx) = mpsc::unbounded_channel::<MessageEnvelope>();
            let subscribers: Arc<DashMap<u64, mpsc::UnboundedSender<MessageEnvelope>>> =
                Arc::new(DashMap::new());
            let waiters: Arc<DashMap<u64, Waiter>> = Arc::new(DashMap::new());

            let loop_subscribers = subscribers.clone();
            let loop_waiters = waiters.clone();
            let loop_topic = topic.to_string();
            tokio::spawn(async move {
                while let Some(envelope) = rx.recv().await {
                    // Resolve every pending correlation this envelope satisfies
                    let matched: Vec<u64> = loop_waiters
                        .iter()
                        .filter(|entry| entry.value().matches(&envelope))
                        .map(|entry| *entry.key())
                        .collect();
                    for id in matched {
                        if let Some((_, waiter)) = loop_waiters.remove(&id) {
                            let _ = waiter.tx.send(envelope.clone());
                        }
                    }

                    // Fan out to subscriber queues; drop closed ones
                    let mut dead = Vec::new();
                    for entry in loop_subscribers.iter() {
                        if entry.value().send(envelope.clone()).is_err() {
                            dead.push(*entry.key());
                        }
                    }
                    for id in dead {
                        loop_subscribers.remove(&id);
                    }
                }
                debug!(topic = %loop_topic, "topic receiver loop ended");
            });

            TopicState {
                tx,
                subscribers,
                waiters,
            }
        });
        entry.tx.clone()
    }

    /// Publish an envelope to its topic. Every current subscriber receives
    /// it; publishing to a topic with no subscribers succeeds and the
    /// envelope is dropped.
    pub fn publish(&self, envelope: MessageEnvelope) -> NexusResult<()> {
        self.ensure_connected()?;
        let tx = self.topic_state(&envelope.topic);
        tx.send(envelope)
            .map_err(|_| NexusError::Messaging("topic receiver loop is gone".to_string()))
    }

    /// Subscribe a handler to a topic. The handler runs on its own task and
    /// sees envelopes in publish order.
    pub fn subscribe(&self, topic: &str, handler: EnvelopeHandler) -> NexusResult<SubscriptionId> {
        self.ensure_connected()?;
        self.topic_state(topic);
        let state = self
            .inner
            .topics
            .get(topic)
            .ok_or_else(|| NexusError::Messaging(format!("topic '{topic}' vanished")))?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<MessageEnvelope>();
        state.subscribers.insert(id, tx);

        let topic_name = topic.to_string();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if let Err(e) = handler(envelope).await {
                    warn!(topic = %topic_name, error = %e, "subscriber handler failed");
                }
            }
        });

        Ok(SubscriptionId(id))
    }

    /// Remove a subscription; its delivery task drains and exits.
    pub fn unsubscribe(&self, topic: &str, subscription: SubscriptionId) {
        if let Some(state) = self.inner.topics.get(topic) {
            state.subscribers.remove(&subscription.0);
        }
    }

    /// Register a pending correlation on `topic` before the request is
    /// published, closing the race where a reply lands between publish and
    /// wait. The returned handle resolves on the first matching envelope.
    pub fn register_reply_waiter(
        &self,
        topic: &str,
        conversation_id: Option<&str>,
        in_reply_to: Option<&str>,
    ) -> NexusResult<PendingReply> {
        self.ensure_connected()?;
        self.topic_state(topic);
        let state = self
            .inner
            .topics
            .get(topic)
            .ok_or_else(|| NexusError::Messaging(format!("topic '{topic}' vanished")))?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        state.waiters.insert(
            id,
            Waiter {
                conversation_id: conversation_id.map(str::to_string),
                in_reply_to: in_reply_to.map(str::to_string),
                tx,
            },
        );
        Ok(PendingReply {
            bus: self.clone(),
            topic: topic.to_string(),
            waiter_id: id,
            rx,
        })
    }

    /// Wait for the first envelope on `topic` matching the given
    /// `conversation_id` and `in_reply_to`. Resolves with the envelope or
    /// fails with the distinct timeout error after `timeout`. The pending
    /// correlation is always removed on exit; `timeout = 0` returns the
    /// timeout error without hanging.
    pub async fn wait_for_reply(
        &self,
        topic: &str,
        conversation_id: Option<&str>,
        in_reply_to: Option<&str>,
        timeout: Duration,
    ) -> NexusResult<MessageEnvelope> {
        self.register_reply_waiter(topic, conversation_id, in_reply_to)?
            .wait(timeout)
            .await
    }

    fn remove_waiter(&self, topic: &str, waiter_id: u64) {
        if let Some(state) = self.inner.topics.get(topic) {
            state.waiters.remove(&waiter_id);
        }
    }

    /// Number of live subscriptions on a topic (observability).
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .get(topic)
            .map(|state| state.subscribers.len())
            .unwrap_or(0)
    }
}

/// A registered correlation waiting for its reply.
#[derive(Debug)]
pub struct PendingReply {
    bus: AgentBus,
    topic: String,
    waiter_id: u64,
    rx: oneshot::Receiver<MessageEnvelope>,
}

impl PendingReply {
    /// Resolve on the first match or fail with the distinct timeout error.
    /// The pending correlation is always removed on exit; `timeout = 0`
    /// returns the timeout error without hanging.
    pub async fn wait(self, timeout: Duration) -> NexusResult<MessageEnvelope> {
        let outcome = tokio::time::timeout(timeout, self.rx).await;
        self.bus.remove_waiter(&self.topic, self.waiter_id);

        match outcome {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) => Err(NexusError::Messaging(
                "bus dropped pending correlation".to_string(),
            )),
            Err(_) => Err(NexusError::ReplyTimeout {
                topic: self.topic,
                waited_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn connected_bus() -> AgentBus {
        let bus = AgentBus::new();
        bus.connect();
        bus
    }

    fn collecting_handler(sink: Arc<Mutex<Vec<MessageEnvelope>>>) -> EnvelopeHandler {
        Arc::new(move |envelope| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().unwrap().push(envelope);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn test_publish_requires_connect() {
        let bus = AgentBus::new();
        let envelope = MessageEnvelope::request("a", "t", json!({}));
        assert!(bus.publish(envelope).is_err());
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_publish_order() {
        let bus = connected_bus();
        let sink = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("orders", collecting_handler(sink.clone()))
            .unwrap();

        for i in 0..20 {
            bus.publish(MessageEnvelope::request("a", "orders", json!({ "seq": i })))
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        let received = sink.lock().unwrap();
        assert_eq!(received.len(), 20);
        for (i, envelope) in received.iter().enumerate() {
            assert_eq!(envelope.payload["seq"], json!(i));
        }
    }

    #[tokio::test]
    async fn test_fanout_to_all_subscribers() {
        let bus = connected_bus();
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("t", collecting_handler(first.clone())).unwrap();
        bus.subscribe("t", collecting_handler(second.clone())).unwrap();

        bus.publish(MessageEnvelope::request("a", "t", json!({}))).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(first.lock().unwrap().len(), 1);
        assert_eq!(second.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_affect_others() {
        let bus = connected_bus();
        let sink = Arc::new(Mutex::new(Vec::new()));
        let failing: EnvelopeHandler = Arc::new(|_| {
            Box::pin(async { Err(NexusError::Messaging("handler exploded".to_string())) })
        });
        bus.subscribe("t", failing).unwrap();
        bus.subscribe("t", collecting_handler(sink.clone())).unwrap();

        bus.publish(MessageEnvelope::request("a", "t", json!({}))).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(sink.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = connected_bus();
        let sink = Arc::new(Mutex::new(Vec::new()));
        let id = bus.subscribe("t", collecting_handler(sink.clone())).unwrap();

        bus.publish(MessageEnvelope::request("a", "t", json!({"n": 1}))).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.unsubscribe("t", id);
        bus.publish(MessageEnvelope::request("a", "t", json!({"n": 2}))).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(sink.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_reply_resolves_on_match() {
        let bus = connected_bus();
        let request = MessageEnvelope::request("pipeline", "search.request", json!({}))
            .with_conversation("conv-9");

        let waiter_bus = bus.clone();
        let request_id = request.message_id.clone();
        let wait = tokio::spawn(async move {
            waiter_bus
                .wait_for_reply(
                    "search.request.response",
                    Some("conv-9"),
                    Some(&request_id),
                    Duration::from_secs(2),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let reply = request.reply("exa_search", json!({"results": []}));
        bus.publish(reply.clone()).unwrap();

        let resolved = wait.await.unwrap().unwrap();
        assert_eq!(resolved.conversation_id.as_deref(), Some("conv-9"));
        assert_eq!(resolved.reply_to, reply.reply_to);
    }

    #[tokio::test]
    async fn test_wait_for_reply_ignores_unrelated_envelopes() {
        let bus = connected_bus();

        let waiter_bus = bus.clone();
        let wait = tokio::spawn(async move {
            waiter_bus
                .wait_for_reply(
                    "t.response",
                    Some("wanted"),
                    Some("msg-1"),
                    Duration::from_millis(300),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        // Same topic, wrong correlation
        let mut noise = MessageEnvelope::request("x", "t.response", json!({}));
        noise.conversation_id = Some("other".to_string());
        noise.reply_to = Some("msg-1".to_string());
        bus.publish(noise).unwrap();

        let result = wait.await.unwrap();
        assert!(matches!(result, Err(NexusError::ReplyTimeout { .. })));
    }

    #[tokio::test]
    async fn test_wait_for_reply_zero_timeout_returns_immediately() {
        let bus = connected_bus();
        let started = std::time::Instant::now();
        let result = bus
            .wait_for_reply("t.response", Some("c"), Some("m"), Duration::ZERO)
            .await;
        assert!(matches!(result, Err(NexusError::ReplyTimeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_wait_for_reply_cleans_up_waiter_on_timeout() {
        let bus = connected_bus();
        let _ = bus
            .wait_for_reply("t.response", Some("c"), Some("m"), Duration::from_millis(10))
            .await;
        let state = bus.inner.topics.get("t.response").unwrap();
        assert!(state.waiters.is_empty());
    }

    #[tokio::test]
    async fn test_registered_waiter_catches_reply_published_before_wait() {
        let bus = connected_bus();
        let request = MessageEnvelope::request("pipeline", "t", json!({}))
            .with_conversation("conv");

        let pending = bus
            .register_reply_waiter("t.response", Some("conv"), Some(&request.message_id))
            .unwrap();

        // Reply lands before anyone awaits the handle
        bus.publish(request.reply("agent", json!({"ok": true}))).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let reply = pending.wait(Duration::from_millis(100)).await.unwrap();
        assert_eq!(reply.payload["ok"], json!(true));
    }

    #[tokio::test]
    async fn test_disconnect_clears_topics() {
        let bus = connected_bus();
        let sink = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("t", collecting_handler(sink)).unwrap();
        bus.disconnect();
        assert!(!bus.is_connected());
        assert_eq!(bus.subscriber_count("t"), 0);
        assert!(bus
            .publish(MessageEnvelope::request("a", "t", json!({})))
            .is_err());
    }
}
