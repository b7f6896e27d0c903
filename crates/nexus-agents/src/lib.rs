//! # nexus-agents
//!
//! Stage handlers for the research pipeline. Every agent consumes one
//! request topic on the in-process bus, does its work against the LLM,
//! search providers, and knowledge store, and replies with a correlated
//! envelope. The registry maps stable `agent_type` strings to
//! constructors; the spawner owns lifecycle.

pub mod aggregator;
pub mod artifact;
pub mod context;
pub mod decomposer;
pub mod enumerator;
pub mod planner;
pub mod reasoner;
pub mod registry;
pub mod search;
pub mod summarizer;
pub mod topics;

pub use context::AgentContext;
pub use enumerator::{SearchSpaceEnumerator, SearchSubspace};
pub use registry::{Agent, AgentRegistry, AgentSpawner};
