//! # Summarizer
//!
//! Turns the aggregated bundle into a structured summary: executive
//! summary, key findings, and the sources they rest on. Same strict-JSON
//! contract and recovery ladder as the decomposer.

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
pub struct SummarizerAgent {
    ctx: Arc<AgentContext>,
}

impl SummarizerAgent {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }

    fn prompt(query: &str, bundle: &Value) -> String {
        format!(
            r#"You are a research summarizer. Produce a concise, structured summary of the aggregated findings below.

Research query: {query}

Aggregated findings (JSON):
{bundle}

Return ONLY a JSON object with this exact structure, no other text:
{{
  "executive_summary": "2-4 sentence synthesis",
  "key_findings": ["finding 1", "finding 2"],
  "sources": ["https://..."]
}}"#
        )
    }

    /// A summary is usable when it carries a non-empty executive summary.
    fn validate(summary: &Value) -> NexusResult<()> {
        match summary.get("executive_summary").and_then(Value::as_str) {
            Some(text) if !text.trim().is_empty() => Ok(()),
            _ => Err(NexusError::Parse(
                "summary missing executive_summary".to_string(),
            )),
        }
    }

    /// Recorded when both the attempt and its retry produced nothing
    /// usable; the pipeline continues with this in place of a summary.
    pub fn placeholder(query: &str) -> Value {
        json!({
            "executive_summary": format!(
                "Summary generation failed for query: {query}. Raw findings are preserved as evidence."
            ),
            "key_findings": [],
            "sources": [],
            "placeholder": true,
        })
    }
}

#[async_trait]
impl Agent for SummarizerAgent {
    fn agent_id(&self) -> &str {
        "summarization"
    }

    fn agent_type(&self) -> &'static str {
        "summarizer"
    }

    fn request_topic(&self) -> &'static str {
        topics::SUMMARIZE
    }

    async fn handle(&self, request: &MessageEnvelope) -> NexusResult<Value> {
        let query = request
            .payload
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| NexusError::stage_failed("summarizing", "request missing query"))?;
        let bundle = request
            .payload
            .get("bundle")
            .cloned()
            .unwrap_or(Value::Null);

        let response = self
            .ctx
            .llm
            .generate(&Self::prompt(query, &bundle), false)
            .await?;
        let summary = parse_json_or_extract(&response)?;
        Self::validate(&summary)?;

        if let Some(operation_id) = request.payload.get("operation_id").and_then(Value::as_str) {
            let evidence = OperationEvidence::new(
                operation_id,
                EvidenceKind::SummaryFragment,
                summary.clone(),
            );
            if let Err(e) = self.ctx.store.append_evidence(&evidence).await {
                tracing::warn!(error = %e, "summary evidence write failed");
            }
        }

        Ok(json!({ "summary": summary }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summarize_request() -> MessageEnvelope {
        MessageEnvelope::request(
            "pipeline",
            topics::SUMMARIZE,
            json!({
                "query": "Impact of AI",
                "bundle": {"key_points": ["a", "b"]},
            }),
        )
    }

    #[tokio::test]
    async fn test_structured_summary_passes_through() {
        let ctx = AgentContext::for_tests(&[]);
        ctx.llm.as_scripted().push_response(
            json!({
                "executive_summary": "AI adoption is accelerating.",
                "key_findings": ["diagnostics lead adoption"],
                "sources": ["https://x.test/a"],
            })
            .to_string(),
        );

        let agent = SummarizerAgent::new(ctx);
        let payload = agent.handle(&summarize_request()).await.unwrap();
        assert_eq!(
            payload["summary"]["executive_summary"],
            json!("AI adoption is accelerating.")
        );
    }

    #[tokio::test]
    async fn test_fenced_summary_is_recovered() {
        let ctx = AgentContext::for_tests(&[]);
        ctx.llm.as_scripted().push_response(
            "```json\n{\"executive_summary\": \"ok\", \"key_findings\": [], \"sources\": []}\n```",
        );
        let agent = SummarizerAgent::new(ctx);
        let payload = agent.handle(&summarize_request()).await.unwrap();
        assert_eq!(payload["summary"]["executive_summary"], json!("ok"));
    }

    #[tokio::test]
    async fn test_malformed_output_is_parse_error() {
        let ctx = AgentContext::for_tests(&[]);
        ctx.llm.as_scripted().push_response("no json at all");
        let agent = SummarizerAgent::new(ctx);
        assert!(matches!(
            agent.handle(&summarize_request()).await,
            Err(NexusError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_executive_summary_is_rejected() {
        let ctx = AgentContext::for_tests(&[]);
        ctx.llm.as_scripted().push_response(
            json!({"executive_summary": "  ", "key_findings": [], "sources": []}).to_string(),
        );
        let agent = SummarizerAgent::new(ctx);
        assert!(agent.handle(&summarize_request()).await.is_err());
    }

    #[test]
    fn test_placeholder_is_marked() {
        let placeholder = SummarizerAgent::placeholder("q");
        assert_eq!(placeholder["placeholder"], json!(true));
        assert!(placeholder["executive_summary"].as_str().unwrap().contains("q"));
    }
}
