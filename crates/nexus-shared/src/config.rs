//! # Environment Configuration
//!
//! Typed configuration for all processes, resolved from environment
//! variables with sensible defaults. Binaries call `dotenvy::dotenv()`
//! before [`NexusConfig::from_env`]; library code never reads the
//! environment directly.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NexusError, NexusResult};

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> NexusResult<T> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| NexusError::Configuration(format!("invalid value for {key}: {raw:?}"))),
        Err(_) => Ok(default),
    }
}

/// Monitoring event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Global kill switch; when false every publish is a successful no-op
    pub enabled: bool,
    /// Serialized event size ceiling in bytes
    pub max_event_size: usize,
    /// Global events channel
    pub events_channel: String,
    /// Stats-only channel (`stats_snapshot`, `queue_depth_update`)
    pub stats_channel: String,
    /// Prefix for project-scoped channels
    pub project_channel_prefix: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_event_size: 8192,
            events_channel: "nexus:events".to_string(),
            stats_channel: "nexus:events:stats".to_string(),
            project_channel_prefix: "nexus:events:project:".to_string(),
        }
    }
}

impl MonitoringConfig {
    pub fn from_env() -> NexusResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            enabled: env_or("NEXUS_MONITORING_ENABLED", "true").to_lowercase() == "true",
            max_event_size: env_parse("MONITORING_MAX_EVENT_SIZE_BYTES", defaults.max_event_size)?,
            events_channel: env_or("MONITORING_EVENTS_CHANNEL", &defaults.events_channel),
            stats_channel: env_or("MONITORING_STATS_CHANNEL", &defaults.stats_channel),
            project_channel_prefix: env_or(
                "MONITORING_PROJECT_CHANNEL_PREFIX",
                &defaults.project_channel_prefix,
            ),
        })
    }

    /// Channel for a specific project id
    pub fn project_channel(&self, project_id: &str) -> String {
        format!("{}{}", self.project_channel_prefix, project_id)
    }
}

/// One configured search provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchProviderSettings {
    /// Stable provider name (`linkup`, `exa`, `perplexity`, `firecrawl`)
    pub name: String,
    pub api_key: String,
    /// Endpoint override; each adapter supplies its own default
    pub url: Option<String>,
}

/// Search providers resolved from the environment; a provider is enabled
/// when its API key variable is present and non-empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchProvidersConfig {
    pub providers: Vec<SearchProviderSettings>,
}

impl SearchProvidersConfig {
    pub const KNOWN: [&'static str; 4] = ["linkup", "exa", "perplexity", "firecrawl"];

    pub fn from_env() -> Self {
        let mut providers = Vec::new();
        for name in Self::KNOWN {
            let key_var = format!("{}_API_KEY", name.to_uppercase());
            let url_var = format!("{}_URL", name.to_uppercase());
            if let Ok(api_key) = env::var(&key_var) {
                if !api_key.trim().is_empty() {
                    providers.push(SearchProviderSettings {
                        name: name.to_string(),
                        api_key,
                        url: env::var(&url_var).ok(),
                    });
                }
            }
        }
        Self { providers }
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.providers.iter().any(|p| p.name == name)
    }

    pub fn enabled_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name.clone()).collect()
    }
}

/// Top-level process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NexusConfig {
    /// PostgreSQL connection string for the knowledge store
    pub database_url: String,
    /// Redis connection string for the work queue and pub/sub
    pub redis_url: String,
    /// Directory for generated artifact files
    pub storage_path: String,
    /// Path to the LLM provider configuration file
    pub llm_config_path: String,
    /// REST/WebSocket bind address
    pub api_host: String,
    pub api_port: u16,
    /// Worker heartbeat cadence in seconds
    pub heartbeat_interval_secs: u64,
    pub monitoring: MonitoringConfig,
    pub search_providers: SearchProvidersConfig,
}

impl Default for NexusConfig {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost/nexus".to_string(),
            redis_url: "redis://localhost:6379/0".to_string(),
            storage_path: "data/storage".to_string(),
            llm_config_path: "config/llm_config.json".to_string(),
            api_host: "0.0.0.0".to_string(),
            api_port: 12000,
            heartbeat_interval_secs: 10,
            monitoring: MonitoringConfig::default(),
            search_providers: SearchProvidersConfig::default(),
        }
    }
}

impl NexusConfig {
    pub fn from_env() -> NexusResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            database_url: env_or("DATABASE_URL", &defaults.database_url),
            redis_url: env_or("REDIS_URL", &defaults.redis_url),
            storage_path: env_or("STORAGE_PATH", &defaults.storage_path),
            llm_config_path: env_or("LLM_CONFIG", &defaults.llm_config_path),
            api_host: env_or("API_HOST", &defaults.api_host),
            api_port: env_parse("API_PORT", defaults.api_port)?,
            heartbeat_interval_secs: env_parse(
                "NEXUS_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval_secs,
            )?,
            monitoring: MonitoringConfig::from_env()?,
            search_providers: SearchProvidersConfig::from_env(),
        })
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Staleness horizon used by the queue supervisor: 2× heartbeat interval
    pub fn heartbeat_stale_after(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs * 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_defaults_match_contract() {
        let config = NexusConfig::default();
        assert_eq!(config.redis_url, "redis://localhost:6379/0");
        assert_eq!(config.monitoring.events_channel, "nexus:events");
        assert_eq!(config.monitoring.stats_channel, "nexus:events:stats");
        assert_eq!(
            config.monitoring.project_channel_prefix,
            "nexus:events:project:"
        );
        assert_eq!(config.monitoring.max_event_size, 8192);
        assert_eq!(config.heartbeat_interval_secs, 10);
        assert_eq!(config.api_port, 12000);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("MONITORING_EVENTS_CHANNEL", "custom:events");
        std::env::set_var("NEXUS_HEARTBEAT_INTERVAL_SECS", "4");
        let config = NexusConfig::from_env().unwrap();
        assert_eq!(config.monitoring.events_channel, "custom:events");
        assert_eq!(config.heartbeat_interval_secs, 4);
        assert_eq!(config.heartbeat_stale_after(), Duration::from_secs(8));
        std::env::remove_var("MONITORING_EVENTS_CHANNEL");
        std::env::remove_var("NEXUS_HEARTBEAT_INTERVAL_SECS");
    }

    #[test]
    #[serial]
    fn test_invalid_numeric_env_is_an_error() {
        std::env::set_var("API_PORT", "not-a-port");
        let result = NexusConfig::from_env();
        assert!(matches!(result, Err(NexusError::Configuration(_))));
        std::env::remove_var("API_PORT");
    }

    #[test]
    #[serial]
    fn test_search_providers_from_env() {
        std::env::set_var("EXA_API_KEY", "k-exa");
        std::env::set_var("LINKUP_API_KEY", "");
        let providers = SearchProvidersConfig::from_env();
        assert!(providers.is_enabled("exa"));
        assert!(!providers.is_enabled("linkup"));
        assert!(!providers.is_enabled("perplexity"));
        std::env::remove_var("EXA_API_KEY");
        std::env::remove_var("LINKUP_API_KEY");
    }

    #[test]
    fn test_project_channel_concatenation() {
        let config = MonitoringConfig::default();
        assert_eq!(config.project_channel("p1"), "nexus:events:project:p1");
    }
}
