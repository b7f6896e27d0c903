//! # Search Adapters
//!
//! Provider-specific request shaping lives here; everything downstream
//! sees one contract: `search(query, options) → Vec<SearchResult>`.
//! Adapters are thin REST wrappers behind an enum — `Scripted` replays
//! canned results for tests.

pub mod adapters;
pub mod agent;

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use nexus_shared::config::SearchProviderSettings;
use nexus_shared::{NexusError, NexusResult};

use adapters::{ExaAdapter, FirecrawlAdapter, LinkupAdapter, PerplexityAdapter};

/// One result row from any provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: Option<String>,
    pub url: String,
    pub snippet: String,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// Full extracted text when the provider returns page content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
    pub retrieved_at: DateTime<Utc>,
}

impl SearchResult {
    pub fn new(provider: impl Into<String>, url: impl Into<String>, snippet: impl Into<String>) -> Self {
        Self {
            title: None,
            url: url.into(),
            snippet: snippet.into(),
            provider: provider.into(),
            score: None,
            extracted_text: None,
            retrieved_at: Utc::now(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_extracted_text(mut self, text: impl Into<String>) -> Self {
        self.extracted_text = Some(text.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SearchOptions {
    pub max_results: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self { max_results: 5 }
    }
}

/// Scripted adapter: canned results per query for hermetic tests.
#[derive(Debug, Default)]
pub struct ScriptedSearch {
    provider: String,
    stubs: Mutex<HashMap<String, Vec<SearchResult>>>,
    failing: Mutex<HashSet<String>>,
    default_results: Mutex<Vec<SearchResult>>,
}

impl ScriptedSearch {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            ..Default::default()
        }
    }

    pub fn stub(&self, query: impl Into<String>, results: Vec<SearchResult>) {
        self.stubs.lock().unwrap().insert(query.into(), results);
    }

    pub fn set_default(&self, results: Vec<SearchResult>) {
        *self.default_results.lock().unwrap() = results;
    }

    /// Make this adapter fail for a specific query.
    pub fn fail_query(&self, query: impl Into<String>) {
        self.failing.lock().unwrap().insert(query.into());
    }

    fn search(&self, query: &str, options: SearchOptions) -> NexusResult<Vec<SearchResult>> {
        if self.failing.lock().unwrap().contains(query) {
            return Err(NexusError::provider(
                self.provider.clone(),
                format!("scripted failure for {query:?}"),
            ));
        }
        let mut results = self
            .stubs
            .lock()
            .unwrap()
            .get(query)
            .cloned()
            .unwrap_or_else(|| self.default_results.lock().unwrap().clone());
        results.truncate(options.max_results);
        Ok(results)
    }
}

/// Search backend, enum-dispatched.
#[derive(Debug)]
pub enum SearchAdapter {
    Linkup(LinkupAdapter),
    Exa(ExaAdapter),
    Perplexity(PerplexityAdapter),
    Firecrawl(FirecrawlAdapter),
    Scripted(ScriptedSearch),
}

impl SearchAdapter {
    /// Build the live adapter for a configured provider. Unknown provider
    /// names fall back to the Exa-style query API shape.
    pub fn from_settings(settings: &SearchProviderSettings) -> Self {
        match settings.name.as_str() {
            "linkup" => Self::Linkup(LinkupAdapter::new(settings)),
            "perplexity" => Self::Perplexity(PerplexityAdapter::new(settings)),
            "firecrawl" => Self::Firecrawl(FirecrawlAdapter::new(settings)),
            _ => Self::Exa(ExaAdapter::new(settings)),
        }
    }

    pub fn new_scripted(provider: &str) -> Self {
        Self::Scripted(ScriptedSearch::new(provider))
    }

    pub fn provider_name(&self) -> &str {
        match self {
            Self::Linkup(a) => a.provider_name(),
            Self::Exa(a) => a.provider_name(),
            Self::Perplexity(a) => a.provider_name(),
            Self::Firecrawl(a) => a.provider_name(),
            Self::Scripted(a) => &a.provider,
        }
    }

    pub async fn search(
        &self,
        query: &str,
        options: SearchOptions,
    ) -> NexusResult<Vec<SearchResult>> {
        match self {
            Self::Linkup(a) => a.search(query, options).await,
            Self::Exa(a) => a.search(query, options).await,
            Self::Perplexity(a) => a.search(query, options).await,
            Self::Firecrawl(a) => a.search(query, options).await,
            Self::Scripted(a) => a.search(query, options),
        }
    }

    /// Access the scripted shim (tests only; panics on live adapters).
    pub fn as_scripted(&self) -> &ScriptedSearch {
        match self {
            Self::Scripted(s) => s,
            _ => panic!("as_scripted called on a live adapter"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_stub_and_default() {
        let adapter = SearchAdapter::new_scripted("exa");
        adapter.as_scripted().stub(
            "ai in healthcare",
            vec![SearchResult::new("exa", "https://x.test/a", "snippet a")],
        );
        adapter
            .as_scripted()
            .set_default(vec![SearchResult::new("exa", "https://x.test/d", "default")]);

        let stubbed = adapter
            .search("ai in healthcare", SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(stubbed[0].url, "https://x.test/a");

        let defaulted = adapter
            .search("anything else", SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(defaulted[0].url, "https://x.test/d");
    }

    #[tokio::test]
    async fn test_scripted_failure_injection() {
        let adapter = SearchAdapter::new_scripted("linkup");
        adapter.as_scripted().fail_query("broken");
        let result = adapter.search("broken", SearchOptions::default()).await;
        assert!(matches!(result, Err(NexusError::Provider { .. })));
    }

    #[tokio::test]
    async fn test_max_results_truncation() {
        let adapter = SearchAdapter::new_scripted("exa");
        adapter.as_scripted().set_default(
            (0..10)
                .map(|i| SearchResult::new("exa", format!("https://x.test/{i}"), "s"))
                .collect(),
        );
        let results = adapter
            .search("q", SearchOptions { max_results: 3 })
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
    }
}
