//! # Error Taxonomy
//!
//! One error enum for the whole system. Every failure a stage or facade can
//! surface maps to one of the categories below; `category()` returns the
//! stable string used in reply envelopes, task metadata, and monitoring
//! events. Only `TransientNetwork` is ever retried automatically.

use thiserror::Error;

/// Result alias used throughout the workspace
pub type NexusResult<T> = Result<T, NexusError>;

/// Unified error type for Nexus Core
#[derive(Debug, Error)]
pub enum NexusError {
    /// Network-level failure that is safe to retry (queue pop, pub/sub publish)
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// A single search/LLM provider failed; recorded as evidence, stage proceeds
    #[error("provider '{provider}' failed: {message}")]
    Provider { provider: String, message: String },

    /// Model output could not be parsed even after the recovery pass
    #[error("failed to parse model output: {0}")]
    Parse(String),

    /// A correlated wait on the messaging bus exceeded its deadline
    #[error("timed out waiting for reply on topic '{topic}' after {waited_ms}ms")]
    ReplyTimeout { topic: String, waited_ms: u64 },

    /// Knowledge-store write failed after pool-level retry; fatal for the stage
    #[error("knowledge store error: {0}")]
    Store(String),

    /// Process shutdown in progress; the current stage aborts
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Retry budget exhausted; the job moved to the dead-letter list
    #[error("task '{task_id}' dead-lettered after {retries} retries")]
    DeadLetter { task_id: String, retries: u32 },

    /// Messaging fabric failure (publish to a disconnected bus, closed topic)
    #[error("messaging error: {0}")]
    Messaging(String),

    /// Work-queue failure that is not transient (malformed envelope, bad key)
    #[error("work queue error: {0}")]
    Queue(String),

    /// A stage reported failure through its reply envelope
    #[error("stage '{stage}' failed: {message}")]
    StageFailed { stage: String, message: String },

    /// Invalid or missing configuration at startup
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Circuit breaker is open for the named component
    #[error("circuit breaker open for '{0}'")]
    CircuitOpen(String),

    /// Guarded admin operation invoked without the confirmation token
    #[error("refusing '{0}' without confirmation token")]
    ConfirmationRequired(String),

    /// Filesystem failure while writing artifacts
    #[error("artifact I/O error: {0}")]
    ArtifactIo(#[from] std::io::Error),
}

impl NexusError {
    /// Stable category string for reply envelopes and task metadata
    pub fn category(&self) -> &'static str {
        match self {
            Self::TransientNetwork(_) => "transient_network",
            Self::Provider { .. } => "provider_error",
            Self::Parse(_) => "parse_error",
            Self::ReplyTimeout { .. } => "timeout",
            Self::Store(_) => "store_error",
            Self::Cancelled(_) => "cancelled",
            Self::DeadLetter { .. } => "dead_letter",
            Self::Messaging(_) => "messaging_error",
            Self::Queue(_) => "queue_error",
            Self::StageFailed { .. } => "stage_failed",
            Self::Configuration(_) => "configuration_error",
            Self::CircuitOpen(_) => "circuit_open",
            Self::ConfirmationRequired(_) => "confirmation_required",
            Self::ArtifactIo(_) => "artifact_io",
        }
    }

    /// Whether the component-level retry policy applies to this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_))
    }

    /// Convenience constructor for provider failures
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for stage failures
    pub fn stage_failed(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StageFailed {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

impl From<redis::RedisError> for NexusError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() || err.is_connection_dropped() || err.is_connection_refusal() {
            Self::TransientNetwork(err.to_string())
        } else {
            Self::Queue(err.to_string())
        }
    }
}

impl From<serde_json::Error> for NexusError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for NexusError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::TransientNetwork(err.to_string())
        } else {
            Self::Provider {
                provider: err
                    .url()
                    .and_then(|u| u.host_str())
                    .unwrap_or("http")
                    .to_string(),
                message: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_are_stable() {
        assert_eq!(
            NexusError::TransientNetwork("x".into()).category(),
            "transient_network"
        );
        assert_eq!(
            NexusError::provider("exa", "rate limited").category(),
            "provider_error"
        );
        assert_eq!(NexusError::Parse("bad json".into()).category(), "parse_error");
        assert_eq!(
            NexusError::ReplyTimeout {
                topic: "t".into(),
                waited_ms: 10
            }
            .category(),
            "timeout"
        );
        assert_eq!(
            NexusError::DeadLetter {
                task_id: "t1".into(),
                retries: 5
            }
            .category(),
            "dead_letter"
        );
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(NexusError::TransientNetwork("x".into()).is_retryable());
        assert!(!NexusError::Store("x".into()).is_retryable());
        assert!(!NexusError::Parse("x".into()).is_retryable());
        assert!(!NexusError::Cancelled("x".into()).is_retryable());
    }
}
