//! # Pub/Sub Providers
//!
//! Channel-oriented publish/subscribe used by the monitoring event bus and
//! the live event endpoint. Two providers behind one enum — no trait
//! objects, all enum dispatch:
//!
//! - `Redis`: production transport over `redis::aio::ConnectionManager`
//!   for publishing and a dedicated pub/sub connection per subscription.
//! - `InMemory`: per-channel `tokio::sync::broadcast` fan-out for tests
//!   and single-process deployments.
//!
//! Subscriptions hand back a [`PubSubStream`]: a bounded mpsc receiver fed
//! by a background forwarder task. Dropping the stream tears the forwarder
//! down.

use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::error::{NexusError, NexusResult};

/// Buffer size for subscriber delivery channels
const SUBSCRIBER_BUFFER_SIZE: usize = 256;

/// A message received from a subscription: `(channel, payload)`.
pub type ChannelMessage = (String, String);

/// Receiver half of a subscription.
#[derive(Debug)]
pub struct PubSubStream {
    rx: mpsc::Receiver<ChannelMessage>,
}

impl PubSubStream {
    /// Receive the next message; `None` when the subscription ended.
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        self.rx.recv().await
    }
}

/// In-memory pub/sub fabric backed by per-channel broadcast senders.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPubSub {
    channels: Arc<DashMap<String, broadcast::Sender<String>>>,
}

impl InMemoryPubSub {
    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_BUFFER_SIZE).0)
            .clone()
    }

    fn publish(&self, channel: &str, payload: &str) {
        // A send error only means no subscriber is currently listening
        let _ = self.sender(channel).send(payload.to_string());
    }

    fn subscribe(&self, channels: &[String]) -> PubSubStream {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER_SIZE);
        for channel in channels {
            let mut source = self.sender(channel).subscribe();
            let tx = tx.clone();
            let name = channel.clone();
            tokio::spawn(async move {
                loop {
                    match source.recv().await {
                        Ok(payload) => {
                            if tx.send((name.clone(), payload)).await.is_err() {
                                break; // subscriber dropped
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(channel = %name, skipped, "in-memory subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }
        PubSubStream { rx }
    }
}

/// Redis-backed pub/sub.
#[derive(Clone)]
pub struct RedisPubSub {
    client: redis::Client,
    manager: redis::aio::ConnectionManager,
}

impl std::fmt::Debug for RedisPubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPubSub").finish()
    }
}

impl RedisPubSub {
    pub async fn connect(redis_url: &str) -> NexusResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| NexusError::Configuration(format!("invalid redis url: {e}")))?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { client, manager })
    }

    async fn publish(&self, channel: &str, payload: &str) -> NexusResult<()> {
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> NexusResult<PubSubStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(channel).await?;
        }
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER_SIZE);
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "undecodable pub/sub payload");
                        continue;
                    }
                };
                if tx.send((channel, payload)).await.is_err() {
                    debug!("pub/sub subscriber dropped, ending forwarder");
                    break;
                }
            }
        });
        Ok(PubSubStream { rx })
    }
}

/// Pub/sub transport, enum-dispatched.
#[derive(Debug, Clone)]
pub enum PubSubProvider {
    Redis(RedisPubSub),
    InMemory(InMemoryPubSub),
}

impl PubSubProvider {
    /// In-memory fabric for tests and single-process runs.
    pub fn new_in_memory() -> Self {
        Self::InMemory(InMemoryPubSub::default())
    }

    /// Connect the Redis transport.
    pub async fn connect_redis(redis_url: &str) -> NexusResult<Self> {
        Ok(Self::Redis(RedisPubSub::connect(redis_url).await?))
    }

    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::Redis(_) => "redis",
            Self::InMemory(_) => "in_memory",
        }
    }

    /// Publish one payload to one channel.
    pub async fn publish(&self, channel: &str, payload: &str) -> NexusResult<()> {
        match self {
            Self::Redis(p) => p.publish(channel, payload).await,
            Self::InMemory(p) => {
                p.publish(channel, payload);
                Ok(())
            }
        }
    }

    /// Subscribe to a set of channels; messages from all of them interleave
    /// on the returned stream.
    pub async fn subscribe(&self, channels: &[String]) -> NexusResult<PubSubStream> {
        match self {
            Self::Redis(p) => p.subscribe(channels).await,
            Self::InMemory(p) => Ok(p.subscribe(channels)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_publish_subscribe() {
        let provider = PubSubProvider::new_in_memory();
        let mut stream = provider
            .subscribe(&["nexus:events".to_string()])
            .await
            .unwrap();

        provider.publish("nexus:events", "hello").await.unwrap();

        let (channel, payload) = stream.recv().await.unwrap();
        assert_eq!(channel, "nexus:events");
        assert_eq!(payload, "hello");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let provider = PubSubProvider::new_in_memory();
        provider.publish("nexus:events", "nobody home").await.unwrap();
    }

    #[tokio::test]
    async fn test_multi_channel_subscription_interleaves() {
        let provider = PubSubProvider::new_in_memory();
        let mut stream = provider
            .subscribe(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();

        provider.publish("a", "1").await.unwrap();
        provider.publish("b", "2").await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let (channel, payload) = stream.recv().await.unwrap();
            seen.push((channel, payload));
        }
        seen.sort();
        assert_eq!(
            seen,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_subscribers_each_receive_fanout() {
        let provider = PubSubProvider::new_in_memory();
        let mut first = provider.subscribe(&["c".to_string()]).await.unwrap();
        let mut second = provider.subscribe(&["c".to_string()]).await.unwrap();

        provider.publish("c", "fan-out").await.unwrap();

        assert_eq!(first.recv().await.unwrap().1, "fan-out");
        assert_eq!(second.recv().await.unwrap().1, "fan-out");
    }
}
