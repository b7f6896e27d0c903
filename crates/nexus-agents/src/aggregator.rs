//! # Data Aggregator
//!
//! Collects per-question search responses into a normalized source set:
//! URLs deduplicated, key points unioned, provenance preserved. When two
//! responses reference the same URL the one with the longest extracted
//! text wins; ties go to the earliest retrieval time.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use nexus_shared::messaging::MessageEnvelope;
use nexus_shared::types::{EvidenceKind, NewSource, OperationEvidence};
use nexus_shared::{NexusError, NexusResult};

use crate::context::AgentContext;
use crate::registry::Agent;
use crate::search::SearchResult;
use crate::topics;

#[derive(Debug)]
pub struct AggregatorAgent {
    ctx: Arc<AgentContext>,
}

impl AggregatorAgent {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }
}

/// Pick the preferred result for each URL: longest extracted text first,
/// earliest retrieval time as tie-break.
pub fn dedup_by_url(results: Vec<SearchResult>) -> Vec<SearchResult> {
    let mut by_url: HashMap<String, SearchResult> = HashMap::new();
    for result in results {
        match by_url.get(&result.url) {
            None => {
                by_url.insert(result.url.clone(), result);
            }
            Some(existing) => {
                let new_len = result.extracted_text.as_deref().map(str::len).unwrap_or(0);
                let old_len = existing
                    .extracted_text
                    .as_deref()
                    .map(str::len)
                    .unwrap_or(0);
                let replace = new_len > old_len
                    || (new_len == old_len && result.retrieved_at < existing.retrieved_at);
                if replace {
                    by_url.insert(result.url.clone(), result);
                }
            }
        }
    }
    let mut deduped: Vec<SearchResult> = by_url.into_values().collect();
    deduped.sort_by(|a, b| a.url.cmp(&b.url));
    deduped
}

#[async_trait]
impl Agent for AggregatorAgent {
    fn agent_id(&self) -> &str {
        "data_aggregator"
    }

    fn agent_type(&self) -> &'static str {
        "aggregator"
    }

    fn request_topic(&self) -> &'static str {
        topics::AGGREGATE
    }

    async fn handle(&self, request: &MessageEnvelope) -> NexusResult<Value> {
        let responses = request
            .payload
            .get("responses")
            .and_then(Value::as_array)
            .ok_or_else(|| NexusError::stage_failed("aggregating", "request missing responses"))?;

        let mut all_results = Vec::new();
        let mut key_points = Vec::new();
        let mut failed_questions = 0usize;

        for response in responses {
            if response.get("error").is_some() {
                failed_questions += 1;
                continue;
            }
            let rows = response
                .get("results")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for row in rows {
                let result: SearchResult = serde_json::from_value(row)?;
                if !result.snippet.is_empty() && !key_points.contains(&result.snippet) {
                    key_points.push(result.snippet.clone());
                }
                all_results.push(result);
            }
        }

        let examined = all_results.len();
        let deduped = dedup_by_url(all_results);

        let mut sources = Vec::with_capacity(deduped.len());
        for result in &deduped {
            let mut new_source = NewSource::new(result.url.clone())
                .with_provider(result.provider.clone())
                .with_accessed_at(result.retrieved_at);
            if let Some(title) = &result.title {
                new_source = new_source.with_title(title.clone());
            }
            if let Some(text) = &result.extracted_text {
                new_source = new_source.with_extracted_text(text.clone());
            }
            sources.push(self.ctx.store.upsert_source(new_source).await?);
        }

        if let Some(operation_id) = request.payload.get("operation_id").and_then(Value::as_str) {
            let evidence = OperationEvidence::new(
                operation_id,
                EvidenceKind::ExtractedFact,
                json!({ "key_points": key_points }),
            );
            if let Err(e) = self.ctx.store.append_evidence(&evidence).await {
                tracing::warn!(error = %e, "aggregation evidence write failed");
            }
        }

        debug!(
            examined,
            unique = sources.len(),
            failed_questions,
            "aggregation complete"
        );

        Ok(json!({
            "sources": sources,
            "key_points": key_points,
            "counts": {
                "sources_examined": examined,
                "sources_unique": sources.len(),
                "questions": responses.len(),
                "failed_questions": failed_questions,
            },
        }))
    }
}
