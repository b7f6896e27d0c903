//! # nexus-queue
//!
//! Redis-backed priority work queue for the Nexus orchestrator: reliable
//! pop with in-flight tracking, worker heartbeats, and the queue
//! supervisor that reclaims jobs from crashed workers.

use std::time::Duration;

pub mod providers;
pub mod queue;
pub mod router;
pub mod supervisor;

pub use queue::{QueueClient, WorkQueueProvider};
pub use router::KeyRouter;
pub use supervisor::{QueueSupervisor, SupervisorReport, MAX_RETRIES};

/// Worker heartbeat key TTL.
pub const HEARTBEAT_TTL: Duration = Duration::from_secs(30);

/// Literal token required by destructive purge operations.
pub const PURGE_CONFIRMATION_TOKEN: &str = "DELETE ALL DATA";
