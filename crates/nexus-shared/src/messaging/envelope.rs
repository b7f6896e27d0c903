//! Typed request/response envelopes carried on the agent bus.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message on the agent bus. Envelopes serialize textually (JSON) and
/// correlate through `conversation_id` + `reply_to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub sender: String,
    /// Intended consumer; topic fan-out still delivers to every subscriber,
    /// handlers filter on this field themselves
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    pub topic: String,
    pub payload: Value,
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

impl MessageEnvelope {
    pub fn request(sender: impl Into<String>, topic: impl Into<String>, payload: Value) -> Self {
        Self {
            sender: sender.into(),
            recipient: None,
            topic: topic.into(),
            payload,
            message_id: crate::types::new_id(),
            reply_to: None,
            conversation_id: None,
        }
    }

    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Build the reply to this envelope: posted on the canonical reply topic,
    /// carrying `reply_to = self.message_id` and the same conversation id.
    pub fn reply(&self, sender: impl Into<String>, payload: Value) -> Self {
        Self {
            sender: sender.into(),
            recipient: Some(self.sender.clone()),
            topic: reply_topic(&self.topic),
            payload,
            message_id: crate::types::new_id(),
            reply_to: Some(self.message_id.clone()),
            conversation_id: self.conversation_id.clone(),
        }
    }

    /// Error reply carrying the error's stable category string.
    pub fn error_reply(&self, sender: impl Into<String>, error: &crate::error::NexusError) -> Self {
        self.reply(
            sender,
            serde_json::json!({
                "error": error.to_string(),
                "category": error.category(),
            }),
        )
    }

    /// Whether this envelope's payload is an error reply.
    pub fn is_error(&self) -> bool {
        self.payload.get("error").is_some()
    }

    /// Error text of an error reply, if any.
    pub fn error_text(&self) -> Option<&str> {
        self.payload.get("error").and_then(Value::as_str)
    }

    /// Error category of an error reply, if any.
    pub fn error_category(&self) -> Option<&str> {
        self.payload.get("category").and_then(Value::as_str)
    }
}

/// Canonical reply topic for a request topic.
pub fn reply_topic(request_topic: &str) -> String {
    format!("{request_topic}.response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_correlation_fields() {
        let request = MessageEnvelope::request("pipeline", "research.decompose", Value::Null)
            .with_conversation("conv-1")
            .with_recipient("decomposer");
        let reply = request.reply("decomposer", serde_json::json!({"ok": true}));

        assert_eq!(reply.topic, "research.decompose.response");
        assert_eq!(reply.reply_to.as_deref(), Some(request.message_id.as_str()));
        assert_eq!(reply.conversation_id.as_deref(), Some("conv-1"));
        assert_eq!(reply.recipient.as_deref(), Some("pipeline"));
    }

    #[test]
    fn test_error_reply_carries_category() {
        let request = MessageEnvelope::request("pipeline", "search.request", Value::Null);
        let reply = request.error_reply(
            "exa_search",
            &crate::error::NexusError::provider("exa", "quota exceeded"),
        );
        assert!(reply.is_error());
        assert_eq!(reply.error_category(), Some("provider_error"));
        assert!(reply.error_text().unwrap().contains("quota exceeded"));
    }

    #[test]
    fn test_envelope_serializes_textually() {
        let envelope = MessageEnvelope::request("a", "t", serde_json::json!({"q": 1}));
        let text = serde_json::to_string(&envelope).unwrap();
        let back: MessageEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(envelope, back);
    }
}
