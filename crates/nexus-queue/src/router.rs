//! # Key Router
//!
//! Redis key naming abstraction for the work queue. Separates key
//! generation from queue operations so deployments can re-prefix without
//! touching the providers.

use nexus_shared::types::Priority;
use nexus_shared::validation::valid_key_segment;
use nexus_shared::{NexusError, NexusResult};

/// Default key prefix
const DEFAULT_PREFIX: &str = "nexus";

/// Key router with the standard Nexus naming conventions:
/// - Priority queues: `nexus:tasks:{tier}_priority`
/// - In-flight set: `nexus:processing:{worker_id}`
/// - Heartbeat: `nexus:worker:heartbeat:{worker_id}`
/// - Dead letter: `nexus:tasks:dead_letter`
#[derive(Debug, Clone)]
pub struct KeyRouter {
    prefix: String,
}

impl Default for KeyRouter {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

impl KeyRouter {
    pub fn new(prefix: impl Into<String>) -> NexusResult<Self> {
        let prefix = prefix.into();
        if !valid_key_segment(&prefix) {
            return Err(NexusError::Configuration(format!(
                "invalid queue key prefix: {prefix:?}"
            )));
        }
        Ok(Self { prefix })
    }

    /// Queue list for a priority tier.
    pub fn queue_key(&self, priority: Priority) -> String {
        format!("{}:tasks:{}_priority", self.prefix, priority.as_str())
    }

    /// All queue keys in scan order (high → normal → low).
    pub fn queue_keys(&self) -> [String; 3] {
        [
            self.queue_key(Priority::High),
            self.queue_key(Priority::Normal),
            self.queue_key(Priority::Low),
        ]
    }

    /// In-flight set for a worker.
    pub fn processing_key(&self, worker_id: u32) -> String {
        format!("{}:processing:{}", self.prefix, worker_id)
    }

    /// Pattern matching every worker's in-flight set.
    pub fn processing_pattern(&self) -> String {
        format!("{}:processing:*", self.prefix)
    }

    /// Extract the worker id from an in-flight set key.
    pub fn worker_id_from_processing_key(&self, key: &str) -> Option<u32> {
        key.strip_prefix(&format!("{}:processing:", self.prefix))?
            .parse()
            .ok()
    }

    /// Heartbeat key for a worker.
    pub fn heartbeat_key(&self, worker_id: u32) -> String {
        format!("{}:worker:heartbeat:{}", self.prefix, worker_id)
    }

    /// Pattern matching every worker heartbeat key.
    pub fn heartbeat_pattern(&self) -> String {
        format!("{}:worker:heartbeat:*", self.prefix)
    }

    /// Dead-letter list.
    pub fn dead_letter_key(&self) -> String {
        format!("{}:tasks:dead_letter", self.prefix)
    }

    /// Per-task status update channel.
    pub fn task_status_channel(&self, task_id: &str) -> String {
        format!("{}:task_status:{}", self.prefix, task_id)
    }
}
