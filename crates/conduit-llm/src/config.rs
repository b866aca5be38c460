//! Provider configuration surface.
//!
//! Configs are owned by an external store (admin-edited); this layer reads
//! them once per registry initialization or explicit refresh and never
//! writes them back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ProviderConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider identifier: "openai", "anthropic", "gemini", "openrouter",
    /// or "offline".
    pub provider: String,
    pub enabled: bool,
    pub active: bool,
    /// Credential as stored; may carry the encryption marker. Decrypted on
    /// read via [`crate::credentials::decrypt_credential`].
    pub credential: String,
    pub base_url: Option<String>,
    pub default_model: String,
    pub requests_per_minute: u32,
    pub requests_per_day: u32,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_tokens_limit: u32,
    /// Lower value is tried first in the fallback chain.
    pub priority: u32,
}

impl ProviderConfig {
    /// A config with sane ceilings for the given provider name; callers
    /// override fields as needed.
    pub fn new(provider: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            enabled: true,
            active: true,
            credential: String::new(),
            base_url: None,
            default_model: default_model.into(),
            requests_per_minute: 60,
            requests_per_day: 10_000,
            timeout_secs: 120,
            connect_timeout_secs: 10,
            max_tokens_limit: 4_096,
            priority: 100,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.enabled && self.active
    }
}

// ---------------------------------------------------------------------------
// ConfigStore
// ---------------------------------------------------------------------------

/// Read-only access to provider configurations.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load_provider_configs(&self) -> conduit_types::Result<Vec<ProviderConfig>>;
}

/// In-memory store for embedding and tests.
pub struct StaticConfigStore {
    configs: Vec<ProviderConfig>,
}

impl StaticConfigStore {
    pub fn new(configs: Vec<ProviderConfig>) -> Self {
        Self { configs }
    }
}

#[async_trait]
impl ConfigStore for StaticConfigStore {
    async fn load_provider_configs(&self) -> conduit_types::Result<Vec<ProviderConfig>> {
        Ok(self.configs.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
