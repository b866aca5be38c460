use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use conduit_types::ConduitError;

use crate::pricing::ModelSpec;
use crate::{CompletionRequest, CompletionResponse, CompletionStream, HealthReport};

// ---------------------------------------------------------------------------
// ProviderAdapter
// ---------------------------------------------------------------------------

/// One implementation per external provider, translating the completion
/// contract to the provider's wire protocol.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Non-streaming completion. Wraps the wire call in the adapter's
    /// internal retry/backoff; surfaces a provider-specific error once the
    /// retry ceiling is exhausted.
    async fn generate(
        &self,
        request: &CompletionRequest,
        model_override: Option<&str>,
    ) -> conduit_types::Result<CompletionResponse>;

    /// Streaming completion. Never internally retried; drop the stream to
    /// cancel the underlying transport.
    async fn generate_streaming(
        &self,
        request: &CompletionRequest,
        model_override: Option<&str>,
    ) -> conduit_types::Result<CompletionStream>;

    /// Pure function over the provider's static price table.
    fn calculate_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64;

    /// Minimal low-cost probe. Captures failures in the report; never errors.
    async fn check_health(&self) -> HealthReport;

    /// Parameter and context-window validation, before any network call.
    fn validate_request(
        &self,
        request: &CompletionRequest,
        model: &str,
    ) -> conduit_types::Result<()>;

    /// Logical model names this adapter answers to.
    fn available_models(&self) -> Vec<String>;

    fn name(&self) -> &str;

    fn default_model(&self) -> &str;
}

// ---------------------------------------------------------------------------
// DynProvider
// ---------------------------------------------------------------------------

/// Cheaply cloneable handle to a registered adapter.
#[derive(Clone)]
pub struct DynProvider(Arc<dyn ProviderAdapter>);

impl DynProvider {
    pub fn new(provider: impl ProviderAdapter + 'static) -> Self {
        Self(Arc::new(provider))
    }

    pub async fn generate(
        &self,
        request: &CompletionRequest,
        model_override: Option<&str>,
    ) -> conduit_types::Result<CompletionResponse> {
        self.0.generate(request, model_override).await
    }

    pub async fn generate_streaming(
        &self,
        request: &CompletionRequest,
        model_override: Option<&str>,
    ) -> conduit_types::Result<CompletionStream> {
        self.0.generate_streaming(request, model_override).await
    }

    pub fn calculate_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        self.0.calculate_cost(model, input_tokens, output_tokens)
    }

    pub async fn check_health(&self) -> HealthReport {
        self.0.check_health().await
    }

    pub fn validate_request(
        &self,
        request: &CompletionRequest,
        model: &str,
    ) -> conduit_types::Result<()> {
        self.0.validate_request(request, model)
    }

    pub fn available_models(&self) -> Vec<String> {
        self.0.available_models()
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn default_model(&self) -> &str {
        self.0.default_model()
    }
}

// ---------------------------------------------------------------------------
// Shared request validation
// ---------------------------------------------------------------------------

/// Range and ceiling checks shared by every adapter. Runs before any
/// network call so malformed requests cost nothing.
pub fn validate_against(
    request: &CompletionRequest,
    spec: &ModelSpec,
) -> conduit_types::Result<()> {
    if !(0.0..=2.0).contains(&request.temperature) {
        return Err(ConduitError::ValidationError(format!(
            "temperature {} out of range [0.0, 2.0]",
            request.temperature
        )));
    }
    if request.max_tokens == 0 {
        return Err(ConduitError::ValidationError(
            "max_tokens must be greater than 0".into(),
        ));
    }
    if request.max_tokens > spec.max_output_tokens {
        return Err(ConduitError::ValidationError(format!(
            "max_tokens {} exceeds {} ceiling of {}",
            request.max_tokens, spec.name, spec.max_output_tokens
        )));
    }
    if let Some(top_p) = request.top_p {
        if !(0.0..=1.0).contains(&top_p) {
            return Err(ConduitError::ValidationError(format!(
                "top_p {top_p} out of range [0.0, 1.0]"
            )));
        }
    }
    for (label, penalty) in [
        ("frequency_penalty", request.frequency_penalty),
        ("presence_penalty", request.presence_penalty),
    ] {
        if let Some(p) = penalty {
            if !(-2.0..=2.0).contains(&p) {
                return Err(ConduitError::ValidationError(format!(
                    "{label} {p} out of range [-2.0, 2.0]"
                )));
            }
        }
    }
    let prompt_tokens = (request.prompt_chars() as u64).div_ceil(4);
    if prompt_tokens + u64::from(request.max_tokens) > u64::from(spec.context_window) {
        return Err(ConduitError::ValidationError(format!(
            "estimated prompt tokens ({prompt_tokens}) plus max_tokens ({}) exceed {} context window of {}",
            request.max_tokens, spec.name, spec.context_window
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// HTTP plumbing shared by the wire adapters
// ---------------------------------------------------------------------------

pub(crate) fn build_http_client(
    timeout_secs: u64,
    connect_timeout_secs: u64,
) -> conduit_types::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(connect_timeout_secs))
        .build()
        .map_err(|e| ConduitError::Other(format!("failed to build HTTP client: {e}")))
}

pub(crate) fn transport_error(
    provider: &str,
    timeout_ms: u64,
    err: reqwest::Error,
) -> ConduitError {
    if err.is_timeout() {
        ConduitError::RequestTimeout {
            provider: provider.to_string(),
            timeout_ms,
        }
    } else {
        ConduitError::ProviderError {
            provider: provider.to_string(),
            status: 0,
            message: err.to_string(),
            retryable: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
