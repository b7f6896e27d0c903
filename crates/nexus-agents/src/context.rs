//! Shared dependencies handed to every agent at spawn time. Built once at
//! bootstrap and passed explicitly — no module-level globals.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use nexus_shared::config::SearchProvidersConfig;
use nexus_shared::llm::LlmClient;
use nexus_shared::messaging::AgentBus;
use nexus_store::KnowledgeStore;

use crate::search::SearchAdapter;

/// Everything an agent needs beyond the request envelope. Agents are
/// stateless between invocations; all continuity lives in the store.
pub struct AgentContext {
    pub bus: AgentBus,
    pub llm: Arc<LlmClient>,
    pub store: KnowledgeStore,
    /// Root directory for generated artifact files
    pub storage_path: PathBuf,
    pub search_providers: SearchProvidersConfig,
    /// Live adapters keyed by provider name
    pub search_adapters: HashMap<String, SearchAdapter>,
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("storage_path", &self.storage_path)
            .field(
                "search_adapters",
                &self.search_adapters.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl AgentContext {
    /// Build adapters for every enabled provider and assemble the context.
    pub fn new(
        bus: AgentBus,
        llm: Arc<LlmClient>,
        store: KnowledgeStore,
        storage_path: PathBuf,
        search_providers: SearchProvidersConfig,
    ) -> Self {
        let search_adapters = search_providers
            .providers
            .iter()
            .map(|settings| (settings.name.clone(), SearchAdapter::from_settings(settings)))
            .collect();
        Self {
            bus,
            llm,
            store,
            storage_path,
            search_providers,
            search_adapters,
        }
    }

    /// Hermetic context for tests: in-memory store, scripted LLM, scripted
    /// search adapter registered as every known provider name passed in.
    pub fn for_tests(providers: &[&str]) -> Arc<Self> {
        let bus = AgentBus::new();
        bus.connect();
        let mut search_adapters = HashMap::new();
        let mut config = SearchProvidersConfig::default();
        for name in providers {
            search_adapters.insert((*name).to_string(), SearchAdapter::new_scripted(name));
            config
                .providers
                .push(nexus_shared::config::SearchProviderSettings {
                    name: (*name).to_string(),
                    api_key: "test-key".to_string(),
                    url: None,
                });
        }
        Arc::new(Self {
            bus,
            llm: Arc::new(LlmClient::scripted()),
            store: KnowledgeStore::new_in_memory(),
            storage_path: std::env::temp_dir().join("nexus-agent-tests"),
            search_providers: config,
            search_adapters,
        })
    }
}
