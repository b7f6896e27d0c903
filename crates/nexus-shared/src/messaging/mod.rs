//! Agent messaging: envelopes and the in-process pub/sub fabric.

mod bus;
mod envelope;

pub use bus::{AgentBus, EnvelopeHandler, PendingReply, SubscriptionId, DEFAULT_REPLY_TIMEOUT};
pub use envelope::{reply_topic, MessageEnvelope};
