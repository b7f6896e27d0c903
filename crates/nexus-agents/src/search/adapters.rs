//! Live provider adapters. Each is a thin REST wrapper that shapes the
//! provider's request and normalizes its response rows into
//! [`SearchResult`]s; provider quirks never leak past this file.

use chrono::Utc;
use serde_json::{json, Value};

use nexus_shared::config::SearchProviderSettings;
use nexus_shared::{NexusError, NexusResult};

use super::{SearchOptions, SearchResult};

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .unwrap_or_default()
}

async fn post_json(
    client: &reqwest::Client,
    provider: &str,
    request: reqwest::RequestBuilder,
) -> NexusResult<Value> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(NexusError::provider(
            provider,
            format!("HTTP {status}: {detail}"),
        ));
    }
    Ok(response.json().await?)
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

// =============================================================================
// LinkUp
// =============================================================================

#[derive(Debug)]
pub struct LinkupAdapter {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl LinkupAdapter {
    const DEFAULT_URL: &'static str = "https://api.linkup.so/v1";

    pub fn new(settings: &SearchProviderSettings) -> Self {
        Self {
            api_key: settings.api_key.clone(),
            base_url: settings
                .url
                .clone()
                .unwrap_or_else(|| Self::DEFAULT_URL.to_string()),
            client: http_client(),
        }
    }

    pub fn provider_name(&self) -> &'static str {
        "linkup"
    }

    pub async fn search(
        &self,
        query: &str,
        options: SearchOptions,
    ) -> NexusResult<Vec<SearchResult>> {
        let body = json!({
            "q": query,
            "depth": "standard",
            "outputType": "searchResults",
        });
        let value = post_json(
            &self.client,
            self.provider_name(),
            self.client
                .post(format!("{}/search", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&body),
        )
        .await?;

        let rows = value["results"].as_array().cloned().unwrap_or_default();
        Ok(rows
            .iter()
            .take(options.max_results)
            .filter_map(|row| {
                let url = str_field(row, "url")?;
                let mut result = SearchResult {
                    title: str_field(row, "name"),
                    url,
                    snippet: str_field(row, "content").unwrap_or_default(),
                    provider: self.provider_name().to_string(),
                    score: None,
                    extracted_text: None,
                    retrieved_at: Utc::now(),
                };
                result.extracted_text = str_field(row, "content");
                Some(result)
            })
            .collect())
    }
}

// =============================================================================
// Exa
// =============================================================================

#[derive(Debug)]
pub struct ExaAdapter {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl ExaAdapter {
    const DEFAULT_URL: &'static str = "https://api.exa.ai";

    pub fn new(settings: &SearchProviderSettings) -> Self {
        Self {
            api_key: settings.api_key.clone(),
            base_url: settings
                .url
                .clone()
                .unwrap_or_else(|| Self::DEFAULT_URL.to_string()),
            client: http_client(),
        }
    }

    pub fn provider_name(&self) -> &'static str {
        "exa"
    }

    pub async fn search(
        &self,
        query: &str,
        options: SearchOptions,
    ) -> NexusResult<Vec<SearchResult>> {
        let body = json!({
            "query": query,
            "numResults": options.max_results,
            "contents": { "text": true },
        });
        let value = post_json(
            &self.client,
            self.provider_name(),
            self.client
                .post(format!("{}/search", self.base_url))
                .header("x-api-key", &self.api_key)
                .json(&body),
        )
        .await?;

        let rows = value["results"].as_array().cloned().unwrap_or_default();
        Ok(rows
            .iter()
            .filter_map(|row| {
                let url = str_field(row, "url")?;
                Some(SearchResult {
                    title: str_field(row, "title"),
                    url,
                    snippet: str_field(row, "text")
                        .map(|t| t.chars().take(400).collect())
                        .unwrap_or_default(),
                    provider: self.provider_name().to_string(),
                    score: row.get("score").and_then(Value::as_f64),
                    extracted_text: str_field(row, "text"),
                    retrieved_at: Utc::now(),
                })
            })
            .collect())
    }
}

// =============================================================================
// Perplexity
// =============================================================================

#[derive(Debug)]
pub struct PerplexityAdapter {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl PerplexityAdapter {
    const DEFAULT_URL: &'static str = "https://api.perplexity.ai";

    pub fn new(settings: &SearchProviderSettings) -> Self {
        Self {
            api_key: settings.api_key.clone(),
            base_url: settings
                .url
                .clone()
                .unwrap_or_else(|| Self::DEFAULT_URL.to_string()),
            client: http_client(),
        }
    }

    pub fn provider_name(&self) -> &'static str {
        "perplexity"
    }

    /// Perplexity answers with a synthesized response plus citations; each
    /// citation becomes one result row carrying the answer as snippet.
    pub async fn search(
        &self,
        query: &str,
        options: SearchOptions,
    ) -> NexusResult<Vec<SearchResult>> {
        let body = json!({
            "model": "sonar",
            "messages": [{"role": "user", "content": query}],
        });
        let value = post_json(
            &self.client,
            self.provider_name(),
            self.client
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&body),
        )
        .await?;

        let answer = value["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let citations = value["citations"].as_array().cloned().unwrap_or_default();

        Ok(citations
            .iter()
            .take(options.max_results)
            .filter_map(Value::as_str)
            .map(|url| {
                SearchResult::new(self.provider_name(), url, answer.clone())
                    .with_extracted_text(answer.clone())
            })
            .collect())
    }
}

// =============================================================================
// Firecrawl
// =============================================================================

#[derive(Debug)]
pub struct FirecrawlAdapter {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl FirecrawlAdapter {
    const DEFAULT_URL: &'static str = "https://api.firecrawl.dev";

    pub fn new(settings: &SearchProviderSettings) -> Self {
        Self {
            api_key: settings.api_key.clone(),
            base_url: settings
                .url
                .clone()
                .unwrap_or_else(|| Self::DEFAULT_URL.to_string()),
            client: http_client(),
        }
    }

    pub fn provider_name(&self) -> &'static str {
        "firecrawl"
    }

    pub async fn search(
        &self,
        query: &str,
        options: SearchOptions,
    ) -> NexusResult<Vec<SearchResult>> {
        let body = json!({
            "query": query,
            "limit": options.max_results,
            "scrapeOptions": { "formats": ["markdown"] },
        });
        let value = post_json(
            &self.client,
            self.provider_name(),
            self.client
                .post(format!("{}/v1/search", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&body),
        )
        .await?;

        let rows = value["data"].as_array().cloned().unwrap_or_default();
        Ok(rows
            .iter()
            .filter_map(|row| {
                let url = str_field(row, "url")?;
                Some(SearchResult {
                    title: str_field(row, "title"),
                    url,
                    snippet: str_field(row, "description").unwrap_or_default(),
                    provider: self.provider_name().to_string(),
                    score: None,
                    extracted_text: str_field(row, "markdown"),
                    retrieved_at: Utc::now(),
                })
            })
            .collect())
    }
}
