//! # nexus-shared
//!
//! Foundation crate for the Nexus research orchestrator: the domain model,
//! error taxonomy, environment configuration, monitoring event bus, agent
//! messaging fabric, LLM client facade, and resilience primitives shared by
//! every other crate in the workspace.

pub mod config;
pub mod error;
pub mod llm;
pub mod messaging;
pub mod monitoring;
pub mod pubsub;
pub mod resilience;
pub mod types;
pub mod validation;

pub use error::{NexusError, NexusResult};
