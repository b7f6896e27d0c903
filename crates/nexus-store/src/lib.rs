//! # nexus-store
//!
//! Knowledge store facade: idempotent upserts and typed reads for tasks,
//! subtasks, operations, evidence, sources, and artifacts, over PostgreSQL
//! in production and an in-memory backend for tests.

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use store::{KnowledgeStore, PURGE_CONFIRMATION_TOKEN};
