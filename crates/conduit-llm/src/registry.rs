//! Adapter registry: discovers enabled provider configurations, owns the
//! adapter lifecycle, and hands out adapters by name.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use conduit_types::ConduitError;

use crate::anthropic::AnthropicAdapter;
use crate::config::{ConfigStore, ProviderConfig};
use crate::gemini::GeminiAdapter;
use crate::offline::{OfflineProvider, OFFLINE_PROVIDER};
use crate::openai::OpenAiAdapter;
use crate::openrouter::OpenRouterAdapter;
use crate::provider::DynProvider;
use crate::HealthReport;

// ---------------------------------------------------------------------------
// Adapter factory
// ---------------------------------------------------------------------------

/// Resolve a provider name to a constructed adapter. Compile-time map
/// instead of dynamic resolution: adding a provider means adding an arm.
pub fn build_adapter(config: &ProviderConfig, secret: &str) -> conduit_types::Result<DynProvider> {
    match config.provider.as_str() {
        "openai" => Ok(DynProvider::new(OpenAiAdapter::from_config(config, secret)?)),
        "anthropic" => Ok(DynProvider::new(AnthropicAdapter::from_config(
            config, secret,
        )?)),
        "gemini" | "google" => Ok(DynProvider::new(GeminiAdapter::from_config(config, secret)?)),
        "openrouter" => Ok(DynProvider::new(OpenRouterAdapter::from_config(
            config, secret,
        )?)),
        OFFLINE_PROVIDER => Ok(DynProvider::new(OfflineProvider::new())),
        other => Err(ConduitError::Other(format!(
            "Unsupported provider type: {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// AdapterRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegistryState {
    Uninitialized,
    Initializing,
    Ready,
}

struct RegistryInner {
    state: RegistryState,
    adapters: HashMap<String, DynProvider>,
    configs: HashMap<String, ProviderConfig>,
}

pub struct AdapterRegistry {
    config_store: Arc<dyn ConfigStore>,
    secret: String,
    inner: RwLock<RegistryInner>,
}

impl AdapterRegistry {
    pub fn new(config_store: Arc<dyn ConfigStore>, secret: impl Into<String>) -> Self {
        Self {
            config_store,
            secret: secret.into(),
            inner: RwLock::new(RegistryInner {
                state: RegistryState::Uninitialized,
                adapters: HashMap::new(),
                configs: HashMap::new(),
            }),
        }
    }

    /// Load enabled+active configs and build their adapters. Idempotent:
    /// a ready registry returns immediately. The write lock makes
    /// concurrent callers single-flight: the second caller blocks, then
    /// observes the ready state.
    pub async fn initialize(&self) -> conduit_types::Result<()> {
        {
            let inner = self.inner.read().await;
            if inner.state == RegistryState::Ready {
                return Ok(());
            }
        }

        let mut inner = self.inner.write().await;
        if inner.state == RegistryState::Ready {
            return Ok(());
        }
        inner.state = RegistryState::Initializing;

        let configs = match self.config_store.load_provider_configs().await {
            Ok(configs) => configs,
            Err(e) => {
                inner.state = RegistryState::Uninitialized;
                return Err(e);
            }
        };

        for config in configs.into_iter().filter(ProviderConfig::is_usable) {
            match build_adapter(&config, &self.secret) {
                Ok(adapter) => {
                    info!(provider = %config.provider, model = %config.default_model, "Initialized provider");
                    inner.adapters.insert(config.provider.clone(), adapter);
                    inner.configs.insert(config.provider.clone(), config);
                }
                Err(e) => {
                    // One bad provider must not take down the rest.
                    warn!(provider = %config.provider, error = %e, "Failed to initialize provider, skipping");
                }
            }
        }

        if inner.adapters.is_empty() {
            warn!("No live providers initialized; only the offline provider is available");
        }
        inner.state = RegistryState::Ready;
        Ok(())
    }

    /// Clear all adapters and re-read the configuration store.
    pub async fn refresh(&self) -> conduit_types::Result<()> {
        {
            let mut inner = self.inner.write().await;
            inner.adapters.clear();
            inner.configs.clear();
            inner.state = RegistryState::Uninitialized;
        }
        self.initialize().await
    }

    /// Adapter by provider name. The offline provider is instantiated
    /// lazily on first request if nothing registered it.
    pub async fn get_adapter(&self, name: &str) -> Option<DynProvider> {
        {
            let inner = self.inner.read().await;
            if let Some(adapter) = inner.adapters.get(name) {
                return Some(adapter.clone());
            }
        }
        if name == OFFLINE_PROVIDER {
            let mut inner = self.inner.write().await;
            let adapter = inner
                .adapters
                .entry(OFFLINE_PROVIDER.to_string())
                .or_insert_with(|| DynProvider::new(OfflineProvider::new()));
            return Some(adapter.clone());
        }
        None
    }

    /// Register an adapter directly, bypassing the factory. Embedders use
    /// this for custom providers; tests for mocks.
    pub async fn insert_adapter(&self, name: impl Into<String>, adapter: DynProvider) {
        let mut inner = self.inner.write().await;
        inner.adapters.insert(name.into(), adapter);
    }

    pub async fn provider_config(&self, name: &str) -> Option<ProviderConfig> {
        self.inner.read().await.configs.get(name).cloned()
    }

    /// Registered provider names ordered by configured priority (lower
    /// first); providers without a config sort last.
    pub async fn adapter_names(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut names: Vec<String> = inner.adapters.keys().cloned().collect();
        names.sort_by_key(|name| {
            (
                inner
                    .configs
                    .get(name)
                    .map(|c| c.priority)
                    .unwrap_or(u32::MAX),
                name.clone(),
            )
        });
        names
    }

    pub async fn is_ready(&self) -> bool {
        self.inner.read().await.state == RegistryState::Ready
    }

    /// Probe every registered adapter, keyed by provider name. Adapter
    /// failures are already captured inside each report, so one bad
    /// provider never poisons the aggregate.
    pub async fn check_all_health(&self) -> HashMap<String, HealthReport> {
        let adapters: Vec<(String, DynProvider)> = {
            let inner = self.inner.read().await;
            inner
                .adapters
                .iter()
                .map(|(name, adapter)| (name.clone(), adapter.clone()))
                .collect()
        };

        let mut results = HashMap::new();
        for (name, adapter) in adapters {
            let report = adapter.check_health().await;
            results.insert(name, report);
        }
        results
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
