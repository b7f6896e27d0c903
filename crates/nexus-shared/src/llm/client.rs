//! # LLM Client Facade
//!
//! The orchestrator only ever needs one operation from a language model:
//! prompt in, text out. The facade is an enum over two shims — an
//! OpenAI-compatible HTTP client configured from a JSON file, and a
//! scripted client that replays canned responses for tests. Enum dispatch,
//! no trait objects.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::{NexusError, NexusResult};

/// Loaded from the file named by `LLM_CONFIG`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub api_base: String,
    pub api_key: String,
    /// Model used for routine generation
    pub model: String,
    /// Model used when a stage requests deeper reasoning
    #[serde(default)]
    pub reasoning_model: Option<String>,
    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_max_tokens() -> u32 {
    4096
}

impl LlmConfig {
    pub fn load(path: impl AsRef<Path>) -> NexusResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            NexusError::Configuration(format!(
                "cannot read LLM config {}: {e}",
                path.as_ref().display()
            ))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| NexusError::Configuration(format!("invalid LLM config: {e}")))
    }
}

/// HTTP shim for an OpenAI-compatible chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct HttpLlm {
    config: LlmConfig,
    http: reqwest::Client,
}

impl HttpLlm {
    pub fn new(config: LlmConfig) -> NexusResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| NexusError::Configuration(format!("http client: {e}")))?;
        Ok(Self { config, http })
    }

    async fn generate(&self, prompt: &str, use_reasoning_model: bool) -> NexusResult<String> {
        let model = if use_reasoning_model {
            self.config
                .reasoning_model
                .as_deref()
                .unwrap_or(&self.config.model)
        } else {
            &self.config.model
        };

        let body = json!({
            "model": model,
            "max_tokens": self.config.max_tokens,
            "messages": [{"role": "user", "content": prompt}],
        });

        let url = format!("{}/chat/completions", self.config.api_base.trim_end_matches('/'));
        debug!(model = %model, prompt_len = prompt.len(), "LLM request");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(NexusError::provider(
                "llm",
                format!("HTTP {status}: {detail}"),
            ));
        }

        let value: serde_json::Value = response.json().await?;
        value["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| NexusError::provider("llm", "response missing message content"))
    }
}

/// Scripted client for tests: replays queued responses in order and records
/// every prompt it saw.
#[derive(Debug, Default)]
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: impl Into<String>) {
        self.responses.lock().unwrap().push_back(response.into());
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    fn generate(&self, prompt: &str) -> NexusResult<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| NexusError::provider("scripted_llm", "no scripted response left"))
    }
}

/// The LLM facade handed to agents.
#[derive(Debug)]
pub enum LlmClient {
    Http(HttpLlm),
    Scripted(ScriptedLlm),
}

impl LlmClient {
    /// Build the HTTP shim from a config file path.
    pub fn from_config_file(path: impl AsRef<Path>) -> NexusResult<Self> {
        Ok(Self::Http(HttpLlm::new(LlmConfig::load(path)?)?))
    }

    /// Scripted client for tests.
    pub fn scripted() -> Self {
        Self::Scripted(ScriptedLlm::new())
    }

    /// Generate a completion for `prompt`.
    pub async fn generate(&self, prompt: &str, use_reasoning_model: bool) -> NexusResult<String> {
        match self {
            Self::Http(client) => client.generate(prompt, use_reasoning_model).await,
            Self::Scripted(client) => client.generate(prompt),
        }
    }

    /// Access the scripted shim (tests only; panics on the HTTP variant).
    pub fn as_scripted(&self) -> &ScriptedLlm {
        match self {
            Self::Scripted(s) => s,
            Self::Http(_) => panic!("as_scripted called on HTTP client"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_replays_in_order() {
        let client = LlmClient::scripted();
        client.as_scripted().push_response("first");
        client.as_scripted().push_response("second");

        assert_eq!(client.generate("p1", false).await.unwrap(), "first");
        assert_eq!(client.generate("p2", true).await.unwrap(), "second");
        assert_eq!(client.as_scripted().prompts(), vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn test_scripted_exhaustion_is_provider_error() {
        let client = LlmClient::scripted();
        let result = client.generate("p", false).await;
        assert!(matches!(result, Err(NexusError::Provider { .. })));
    }

    #[test]
    fn test_config_parses_with_defaults() {
        let config: LlmConfig = serde_json::from_str(
            r#"{"api_base": "https://api.test/v1", "api_key": "k", "model": "m"}"#,
        )
        .unwrap();
        assert_eq!(config.timeout_secs, 120);
        assert_eq!(config.max_tokens, 4096);
        assert!(config.reasoning_model.is_none());
    }

    #[test]
    fn test_config_load_missing_file_is_configuration_error() {
        let result = LlmConfig::load("/nonexistent/llm_config.json");
        assert!(matches!(result, Err(NexusError::Configuration(_))));
    }
}
