//! One search agent per enabled provider. All of them subscribe to the
//! same request topic and filter on the envelope recipient, so the caller
//! picks the provider by addressing the request.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use nexus_shared::messaging::MessageEnvelope;
use nexus_shared::types::{EvidenceKind, OperationEvidence, Provenance};
use nexus_shared::{NexusError, NexusResult};

use crate::context::AgentContext;
use crate::registry::Agent;
use crate::search::SearchOptions;
use crate::topics;

#[derive(Debug)]
pub struct SearchAgent {
    ctx: Arc<AgentContext>,
    provider: String,
    agent_id: String,
}

impl SearchAgent {
    pub fn new(ctx: Arc<AgentContext>, provider: &str) -> NexusResult<Self> {
        if !ctx.search_adapters.contains_key(provider) {
            return Err(NexusError::Configuration(format!(
                "no adapter configured for provider {provider:?}"
            )));
        }
        Ok(Self {
            ctx,
            provider: provider.to_string(),
            agent_id: format!("{provider}_search"),
        })
    }

    /// Record one evidence row per result when the request names an
    /// operation. Evidence failures are logged, not surfaced; the search
    /// response is still useful without them.
    async fn record_evidence(&self, operation_id: &str, question: &str, results: &[Value]) {
        for result in results {
            let url = result.get("url").and_then(Value::as_str);
            let evidence = OperationEvidence::new(
                operation_id,
                EvidenceKind::SearchResult,
                json!({ "question": question, "result": result }),
            )
            .with_provenance(Provenance {
                source_url: url.map(str::to_string),
                provider: Some(self.provider.clone()),
                retrieved_at: Some(chrono::Utc::now()),
            });
            if let Err(e) = self.ctx.store.append_evidence(&evidence).await {
                tracing::warn!(provider = %self.provider, error = %e, "evidence write failed");
            }
        }
    }
}

#[async_trait]
impl Agent for SearchAgent {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    fn agent_type(&self) -> &'static str {
        "search"
    }

    fn request_topic(&self) -> &'static str {
        topics::SEARCH
    }

    async fn handle(&self, request: &MessageEnvelope) -> NexusResult<Value> {
        let query = request
            .payload
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| NexusError::stage_failed("searching", "request missing query"))?;
        let max_results = request
            .payload
            .get("max_results")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(SearchOptions::default().max_results);

        let adapter = self
            .ctx
            .search_adapters
            .get(&self.provider)
            .expect("adapter presence checked at construction");

        debug!(provider = %self.provider, query, "searching");
        let results = adapter.search(query, SearchOptions { max_results }).await?;
        let result_values: Vec<Value> = results
            .iter()
            .map(|r| serde_json::to_value(r))
            .collect::<Result<_, _>>()?;

        if let Some(operation_id) = request.payload.get("operation_id").and_then(Value::as_str) {
            self.record_evidence(operation_id, query, &result_values).await;
        }

        Ok(json!({
            "provider": self.provider,
            "query": query,
            "results": result_values,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::SearchResult;

    fn ctx_with_stub() -> Arc<AgentContext> {
        let ctx = AgentContext::for_tests(&["exa"]);
        ctx.search_adapters["exa"].as_scripted().stub(
            "ai in healthcare",
            vec![
                SearchResult::new("exa", "https://x.test/a", "snippet a").with_title("A"),
                SearchResult::new("exa", "https://x.test/b", "snippet b"),
            ],
        );
        ctx
    }

    #[tokio::test]
    async fn test_search_agent_returns_provider_rows() {
        let ctx = ctx_with_stub();
        let agent = SearchAgent::new(ctx, "exa").unwrap();

        let request = MessageEnvelope::request(
            "pipeline",
            topics::SEARCH,
            json!({"query": "ai in healthcare"}),
        );
        let payload = agent.handle(&request).await.unwrap();
        assert_eq!(payload["provider"], json!("exa"));
        assert_eq!(payload["results"].as_array().unwrap().len(), 2);
        assert_eq!(payload["results"][0]["url"], json!("https://x.test/a"));
    }

    #[tokio::test]
    async fn test_search_agent_writes_evidence_when_operation_given() {
        let ctx = ctx_with_stub();
        let operation = ctx.store.open_operation("t1", "searching").await.unwrap();
        let agent = SearchAgent::new(ctx.clone(), "exa").unwrap();

        let request = MessageEnvelope::request(
            "pipeline",
            topics::SEARCH,
            json!({"query": "ai in healthcare", "operation_id": operation.operation_id}),
        );
        agent.handle(&request).await.unwrap();

        let evidence = ctx
            .store
            .evidence_for_operation(&operation.operation_id)
            .await
            .unwrap();
        assert_eq!(evidence.len(), 2);
        assert_eq!(evidence[0].kind, EvidenceKind::SearchResult);
        assert_eq!(
            evidence[0].provenance.provider.as_deref(),
            Some("exa")
        );
    }

    #[tokio::test]
    async fn test_search_agent_surfaces_provider_error() {
        let ctx = AgentContext::for_tests(&["exa"]);
        ctx.search_adapters["exa"].as_scripted().fail_query("broken");
        let agent = SearchAgent::new(ctx, "exa").unwrap();

        let request =
            MessageEnvelope::request("pipeline", topics::SEARCH, json!({"query": "broken"}));
        let result = agent.handle(&request).await;
        assert!(matches!(result, Err(NexusError::Provider { .. })));
    }

    #[tokio::test]
    async fn test_unknown_provider_rejected_at_construction() {
        let ctx = AgentContext::for_tests(&[]);
        assert!(SearchAgent::new(ctx, "exa").is_err());
    }
}
