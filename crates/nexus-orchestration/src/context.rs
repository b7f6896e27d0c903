//! # System Context
//!
//! Every long-lived handle a process needs — store, queue, pub/sub,
//! event bus — built once at startup and passed explicitly through
//! handlers. Lifecycle is tied to server/worker start and stop; there are
//! no module-level globals.

use std::sync::Arc;

use nexus_queue::{KeyRouter, WorkQueueProvider};
use nexus_shared::config::NexusConfig;
use nexus_shared::monitoring::EventBus;
use nexus_shared::pubsub::PubSubProvider;
use nexus_shared::NexusResult;
use nexus_store::KnowledgeStore;
use tracing::info;

#[derive(Debug)]
pub struct SystemContext {
    pub config: NexusConfig,
    pub store: KnowledgeStore,
    pub queue: WorkQueueProvider,
    pub pubsub: PubSubProvider,
    pub event_bus: EventBus,
    pub key_router: KeyRouter,
}

impl SystemContext {
    /// Production wiring: PostgreSQL store, Redis queue and pub/sub.
    /// Non-recoverable failures here exit the process non-zero.
    pub async fn production(config: NexusConfig) -> NexusResult<Arc<Self>> {
        let store = KnowledgeStore::connect(&config.database_url).await?;
        let key_router = KeyRouter::default();
        let queue =
            WorkQueueProvider::connect_redis(&config.redis_url, key_router.clone()).await?;
        let pubsub = PubSubProvider::connect_redis(&config.redis_url).await?;
        let event_bus = EventBus::new(pubsub.clone(), config.monitoring.clone());

        info!(
            store = store.provider_name(),
            queue = queue.provider_name(),
            "system context initialized"
        );
        Ok(Arc::new(Self {
            config,
            store,
            queue,
            pubsub,
            event_bus,
            key_router,
        }))
    }

    /// Hermetic wiring: everything in-memory. Used by tests and available
    /// for single-process experiments.
    pub fn in_memory(config: NexusConfig) -> Arc<Self> {
        let pubsub = PubSubProvider::new_in_memory();
        let event_bus = EventBus::new(pubsub.clone(), config.monitoring.clone());
        Arc::new(Self {
            config,
            store: KnowledgeStore::new_in_memory(),
            queue: WorkQueueProvider::new_in_memory(),
            pubsub,
            event_bus,
            key_router: KeyRouter::default(),
        })
    }

    /// Tear down pooled connections.
    pub async fn shutdown(&self) {
        self.store.close().await;
        info!("system context shut down");
    }
}
