//! Resilient multi-provider completion layer.
//!
//! One uniform way to request text completions from OpenAI-compatible,
//! Anthropic, Gemini, and OpenRouter backends: `ProviderAdapter` hides each
//! wire protocol, `AdapterRegistry` owns adapter lifecycle, the
//! `FallbackOrchestrator` fails over across providers, `RateLimiter` bounds
//! admission, and `UsageTracker` keeps the cost ledger.

mod anthropic;
mod backoff;
mod config;
mod credentials;
mod fallback;
mod gemini;
mod offline;
mod openai;
mod openrouter;
mod pricing;
mod provider;
mod ratelimit;
mod registry;
mod sse;
mod types;
mod usage;

pub use anthropic::AnthropicAdapter;
pub use backoff::{execute_with_retry, BackoffPolicy, DEFAULT_MAX_ATTEMPTS};
pub use config::{ConfigStore, ProviderConfig, StaticConfigStore};
pub use credentials::{
    decrypt_credential, encrypt_credential, is_encrypted, ENCRYPTION_MARKER,
};
pub use fallback::FallbackOrchestrator;
pub use gemini::GeminiAdapter;
pub use offline::{OfflineProvider, OFFLINE_PROVIDER};
pub use openai::OpenAiAdapter;
pub use openrouter::OpenRouterAdapter;
pub use pricing::{
    estimate_tokens, ModelSpec, PriceTable, ANTHROPIC_PRICES, GEMINI_PRICES, OPENAI_PRICES,
    OPENROUTER_PRICES,
};
pub use provider::{validate_against, DynProvider, ProviderAdapter};
pub use ratelimit::{
    InMemoryRateLimitStore, RateLimitDecision, RateLimitStore, RateLimiter, RedisRateLimitStore,
};
pub use registry::{build_adapter, AdapterRegistry};
pub use types::*;
pub use usage::{
    CostSummary, InMemoryUsageStore, ProviderTotals, UsageRecord, UsageStore, UsageTracker,
};
