//! # nexus-worker
//!
//! The background worker: pops research jobs from the queue and drives
//! them through the orchestration pipeline, one task at a time.

mod worker;

pub use worker::{ResearchWorker, WorkerConfig};
