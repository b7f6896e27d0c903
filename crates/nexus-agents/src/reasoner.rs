//! # Reasoner
//!
//! Higher-order reasoning over the summary: synthesis, contradictions,
//! credibility, gaps, insights, recommendations. Uses the reasoning model
//! when the LLM config provides one.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use nexus_shared::llm::parse_json_or_extract;
use nexus_shared::messaging::MessageEnvelope;
use nexus_shared::types::{EvidenceKind, OperationEvidence};
use nexus_shared::{NexusError, NexusResult};

use crate::context::AgentContext;
use crate::registry::Agent;
use crate::topics;

#[derive(Debug)]
pub struct ReasonerAgent {
    ctx: Arc<AgentContext>,
}

impl ReasonerAgent {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }

    fn prompt(query: &str, summary: &Value) -> String {
        format!(
            r#"You are a research analyst performing higher-order reasoning over a summarized body of findings.

Research query: {query}

Summary (JSON):
{summary}

Analyze the material. Return ONLY a JSON object with this exact structure, no other text:
{{
  "synthesis": "integrated analysis",
  "contradictions": ["conflicting claims found, if any"],
  "credibility_assessment": "how trustworthy the sources are",
  "gaps": ["open questions the material does not answer"],
  "insights": ["non-obvious implications"],
  "recommendations": ["concrete next steps"]
}}"#
        )
    }

    fn validate(reasoning: &Value) -> NexusResult<()> {
        match reasoning.get("synthesis").and_then(Value::as_str) {
            Some(text) if !text.trim().is_empty() => Ok(()),
            _ => Err(NexusError::Parse("reasoning missing synthesis".to_string())),
        }
    }

    pub fn placeholder(query: &str) -> Value {
        json!({
            "synthesis": format!("Reasoning generation failed for query: {query}."),
            "contradictions": [],
            "credibility_assessment": "not assessed",
            "gaps": [],
            "insights": [],
            "recommendations": [],
            "placeholder": true,
        })
    }
}

#[async_trait]
impl Agent for ReasonerAgent {
    fn agent_id(&self) -> &str {
        "reasoning"
    }

    fn agent_type(&self) -> &'static str {
        "reasoner"
    }

    fn request_topic(&self) -> &'static str {
        topics::REASON
    }

    async fn handle(&self, request: &MessageEnvelope) -> NexusResult<Value> {
        let query = request
            .payload
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| NexusError::stage_failed("reasoning", "request missing query"))?;
        let summary = request
            .payload
            .get("summary")
            .cloned()
            .unwrap_or(Value::Null);

        let response = self
            .ctx
            .llm
            .generate(&Self::prompt(query, &summary), true)
            .await?;
        let reasoning = parse_json_or_extract(&response)?;
        Self::validate(&reasoning)?;

        if let Some(operation_id) = request.payload.get("operation_id").and_then(Value::as_str) {
            let evidence = OperationEvidence::new(
                operation_id,
                EvidenceKind::ReasoningConclusion,
                reasoning.clone(),
            );
            if let Err(e) = self.ctx.store.append_evidence(&evidence).await {
                tracing::warn!(error = %e, "reasoning evidence write failed");
            }
        }

        Ok(json!({ "reasoning": reasoning }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason_request() -> MessageEnvelope {
        MessageEnvelope::request(
            "pipeline",
            topics::REASON,
            json!({
                "query": "Impact of AI",
                "summary": {"executive_summary": "AI is growing."},
            }),
        )
    }

    #[tokio::test]
    async fn test_structured_reasoning_passes_through() {
        let ctx = AgentContext::for_tests(&[]);
        ctx.llm.as_scripted().push_response(
            json!({
                "synthesis": "Adoption outpaces regulation.",
                "contradictions": [],
                "credibility_assessment": "high",
                "gaps": ["long-term outcomes"],
                "insights": ["regulatory lag creates risk"],
                "recommendations": ["track FDA approvals"],
            })
            .to_string(),
        );

        let agent = ReasonerAgent::new(ctx.clone());
        let payload = agent.handle(&reason_request()).await.unwrap();
        assert_eq!(
            payload["reasoning"]["synthesis"],
            json!("Adoption outpaces regulation.")
        );
        // The reasoner asks for the reasoning model
        assert_eq!(ctx.llm.as_scripted().prompts().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_reasoning_is_parse_error() {
        let ctx = AgentContext::for_tests(&[]);
        ctx.llm.as_scripted().push_response("not json");
        let agent = ReasonerAgent::new(ctx);
        assert!(matches!(
            agent.handle(&reason_request()).await,
            Err(NexusError::Parse(_))
        ));
    }

    #[test]
    fn test_placeholder_shape() {
        let placeholder = ReasonerAgent::placeholder("q");
        assert_eq!(placeholder["placeholder"], json!(true));
        assert_eq!(placeholder["credibility_assessment"], json!("not assessed"));
    }
}
