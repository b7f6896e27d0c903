//! # nexus-orchestration
//!
//! The research pipeline state machine, system bootstrap, continuous-mode
//! scheduler, and the REST/WebSocket API surface.

pub mod context;
pub mod continuous;
pub mod pipeline;
pub mod stats;
pub mod web;

pub use context::SystemContext;
pub use continuous::ContinuousScheduler;
pub use pipeline::{PipelineConfig, PipelineOutcome, ResearchPipeline, Stage};
