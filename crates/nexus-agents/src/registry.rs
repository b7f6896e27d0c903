//! # Agent Registry and Spawner
//!
//! Agents are stage handlers: each subscribes to exactly one request topic,
//! does its work, and replies on the canonical reply topic with
//! `conversation_id` and `in_reply_to` copied from the request. The
//! registry maps a stable `agent_type` string to a constructor; the
//! spawner owns the start/stop lifecycle of the spawned set. No
//! inheritance chain — one trait is the whole capability surface.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use nexus_shared::messaging::{EnvelopeHandler, MessageEnvelope, SubscriptionId};
use nexus_shared::{NexusError, NexusResult};

use crate::context::AgentContext;
use crate::search::agent::SearchAgent;

/// One stage handler. `handle` returns the reply payload; errors become
/// typed error replies.
#[async_trait]
pub trait Agent: Send + Sync + 'static {
    /// Unique instance id, used as the envelope sender and recipient
    fn agent_id(&self) -> &str;

    /// Registry key (`decomposer`, `planner`, `search:exa`, ...)
    fn agent_type(&self) -> &'static str;

    /// The single request topic this agent consumes
    fn request_topic(&self) -> &'static str;

    async fn handle(&self, request: &MessageEnvelope) -> NexusResult<Value>;
}

type AgentConstructor = Box<dyn Fn(Arc<AgentContext>) -> NexusResult<Arc<dyn Agent>> + Send + Sync>;

/// String-keyed constructors for every agent variant.
pub struct AgentRegistry {
    constructors: HashMap<String, AgentConstructor>,
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("types", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        agent_type: impl Into<String>,
        constructor: impl Fn(Arc<AgentContext>) -> NexusResult<Arc<dyn Agent>> + Send + Sync + 'static,
    ) {
        self.constructors
            .insert(agent_type.into(), Box::new(constructor));
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.constructors.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn construct(
        &self,
        agent_type: &str,
        ctx: Arc<AgentContext>,
    ) -> NexusResult<Arc<dyn Agent>> {
        let constructor = self.constructors.get(agent_type).ok_or_else(|| {
            NexusError::Configuration(format!("unknown agent type {agent_type:?}"))
        })?;
        constructor(ctx)
    }

    /// The standard agent set: one of each pipeline handler plus one
    /// search agent per enabled provider.
    pub fn with_defaults(search_provider_names: &[String]) -> Self {
        let mut registry = Self::new();
        registry.register("decomposer", |ctx| {
            Ok(Arc::new(crate::decomposer::DecomposerAgent::new(ctx)) as Arc<dyn Agent>)
        });
        registry.register("planner", |ctx| {
            Ok(Arc::new(crate::planner::PlannerAgent::new(ctx)) as Arc<dyn Agent>)
        });
        registry.register("aggregator", |ctx| {
            Ok(Arc::new(crate::aggregator::AggregatorAgent::new(ctx)) as Arc<dyn Agent>)
        });
        registry.register("summarizer", |ctx| {
            Ok(Arc::new(crate::summarizer::SummarizerAgent::new(ctx)) as Arc<dyn Agent>)
        });
        registry.register("reasoner", |ctx| {
            Ok(Arc::new(crate::reasoner::ReasonerAgent::new(ctx)) as Arc<dyn Agent>)
        });
        registry.register("artifact", |ctx| {
            Ok(Arc::new(crate::artifact::ArtifactAgent::new(ctx)) as Arc<dyn Agent>)
        });
        for name in search_provider_names {
            let provider = name.clone();
            registry.register(format!("search:{name}"), move |ctx| {
                Ok(Arc::new(SearchAgent::new(ctx, &provider)?) as Arc<dyn Agent>)
            });
        }
        registry
    }
}

/// Owns the spawned agent set and its bus subscriptions.
pub struct AgentSpawner {
    ctx: Arc<AgentContext>,
    spawned: Mutex<Vec<(Arc<dyn Agent>, SubscriptionId)>>,
}

impl std::fmt::Debug for AgentSpawner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSpawner")
            .field("spawned", &self.spawned.lock().unwrap().len())
            .finish()
    }
}

impl AgentSpawner {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self {
            ctx,
            spawned: Mutex::new(Vec::new()),
        }
    }

    /// Construct and start one agent: subscribe it to its request topic.
    /// Envelopes addressed to a different recipient are ignored; handler
    /// results are published as correlated replies.
    pub fn spawn(&self, registry: &AgentRegistry, agent_type: &str) -> NexusResult<Arc<dyn Agent>> {
        let agent = registry.construct(agent_type, self.ctx.clone())?;
        let subscription = self.subscribe(agent.clone())?;
        self.spawned
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((agent.clone(), subscription));
        info!(agent_id = %agent.agent_id(), topic = %agent.request_topic(), "agent started");
        Ok(agent)
    }

    /// Spawn every type registered in the registry.
    pub fn spawn_all(&self, registry: &AgentRegistry) -> NexusResult<Vec<Arc<dyn Agent>>> {
        registry
            .registered_types()
            .iter()
            .map(|agent_type| self.spawn(registry, agent_type))
            .collect()
    }

    fn subscribe(&self, agent: Arc<dyn Agent>) -> NexusResult<SubscriptionId> {
        let bus = self.ctx.bus.clone();
        let handler_agent = agent.clone();
        let handler: EnvelopeHandler = Arc::new(move |request: MessageEnvelope| {
            let agent = handler_agent.clone();
            let bus = bus.clone();
            Box::pin(async move {
                if let Some(recipient) = &request.recipient {
                    if recipient != agent.agent_id() {
                        return Ok(());
                    }
                }
                debug!(
                    agent_id = %agent.agent_id(),
                    message_id = %request.message_id,
                    "agent handling request"
                );
                let reply = match agent.handle(&request).await {
                    Ok(payload) => request.reply(agent.agent_id(), payload),
                    Err(error) => {
                        warn!(agent_id = %agent.agent_id(), error = %error, "agent request failed");
                        request.error_reply(agent.agent_id(), &error)
                    }
                };
                bus.publish(reply)
            })
        });
        self.ctx.bus.subscribe(agent.request_topic(), handler)
    }

    /// Stop every spawned agent by dropping its subscription.
    pub fn stop_all(&self) {
        let mut spawned = self.spawned.lock().unwrap_or_else(|p| p.into_inner());
        for (agent, subscription) in spawned.drain(..) {
            self.ctx.bus.unsubscribe(agent.request_topic(), subscription);
            info!(agent_id = %agent.agent_id(), "agent stopped");
        }
    }

    pub fn spawned_count(&self) -> usize {
        self.spawned.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}
