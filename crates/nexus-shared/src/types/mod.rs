//! Domain model shared by every crate in the workspace.

mod artifact;
mod job;
mod operation;
mod source;
mod stats;
mod task;

pub use artifact::{Artifact, ArtifactKind};
pub use job::{JobEnvelope, Priority};
pub use operation::{EvidenceKind, OperationEvidence, OperationStatus, Provenance, TaskOperation};
pub use source::{NewSource, Source};
pub use stats::{GlobalStats, QueueDepths, WorkerHeartbeat};
pub use task::{ResearchTask, Subtask, TaskStatus};

/// Generate an opaque id for a new entity.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
