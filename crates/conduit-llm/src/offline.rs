//! Deterministic offline provider.
//!
//! Always constructible without credentials, so the layer stays exercisable
//! when no live provider initializes, and deterministic so tests can assert
//! on its output. Costs nothing and is excluded from usage accounting.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;

use crate::pricing::{estimate_tokens, ModelSpec};
use crate::provider::{validate_against, ProviderAdapter};
use crate::{CompletionRequest, CompletionResponse, CompletionStream, HealthReport};

/// Registry name of the offline provider.
pub const OFFLINE_PROVIDER: &str = "offline";

const OFFLINE_MODEL: &str = "offline-echo";

// Generous synthetic limits; the offline provider accepts anything a real
// model could.
const OFFLINE_SPEC: ModelSpec = ModelSpec {
    name: OFFLINE_MODEL,
    input_per_million: 0.0,
    output_per_million: 0.0,
    context_window: 1_000_000,
    max_output_tokens: 100_000,
};

#[derive(Debug, Default)]
pub struct OfflineProvider;

impl OfflineProvider {
    pub fn new() -> Self {
        Self
    }

    fn reply_for(request: &CompletionRequest) -> String {
        let last_user = request
            .conversation()
            .iter()
            .rev()
            .find(|m| m.role == crate::Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        format!("[offline] {last_user}")
    }
}

#[async_trait]
impl ProviderAdapter for OfflineProvider {
    async fn generate(
        &self,
        request: &CompletionRequest,
        model_override: Option<&str>,
    ) -> conduit_types::Result<CompletionResponse> {
        let model = model_override.unwrap_or(OFFLINE_MODEL).to_string();
        self.validate_request(request, &model)?;

        let text = Self::reply_for(request);
        let tokens_used =
            (request.prompt_chars() as u64).div_ceil(4) + estimate_tokens(&text);

        let mut metadata = HashMap::new();
        metadata.insert("deterministic".to_string(), json!(true));
        metadata.insert("tokens_estimated".to_string(), json!(true));
        metadata.insert("latency_ms".to_string(), json!(0));

        Ok(CompletionResponse {
            text,
            model,
            provider: OFFLINE_PROVIDER.into(),
            tokens_used,
            cost: 0.0,
            finish_reason: "stop".into(),
            metadata,
        })
    }

    async fn generate_streaming(
        &self,
        request: &CompletionRequest,
        model_override: Option<&str>,
    ) -> conduit_types::Result<CompletionStream> {
        let model = model_override.unwrap_or(OFFLINE_MODEL).to_string();
        self.validate_request(request, &model)?;

        let text = Self::reply_for(request);
        let fragments: Vec<conduit_types::Result<String>> = text
            .chars()
            .collect::<Vec<_>>()
            .chunks(8)
            .map(|chunk| Ok(chunk.iter().collect::<String>()))
            .collect();

        Ok(Box::pin(tokio_stream::iter(fragments)))
    }

    fn calculate_cost(&self, _model: &str, _input_tokens: u64, _output_tokens: u64) -> f64 {
        0.0
    }

    async fn check_health(&self) -> HealthReport {
        HealthReport::healthy(0)
    }

    fn validate_request(
        &self,
        request: &CompletionRequest,
        _model: &str,
    ) -> conduit_types::Result<()> {
        validate_against(request, &OFFLINE_SPEC)
    }

    fn available_models(&self) -> Vec<String> {
        vec![OFFLINE_MODEL.to_string()]
    }

    fn name(&self) -> &str {
        OFFLINE_PROVIDER
    }

    fn default_model(&self) -> &str {
        OFFLINE_MODEL
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn deterministic_echo() {
        let provider = OfflineProvider::new();
        let req = CompletionRequest::from_prompt("hello offline");

        let first = provider.generate(&req, None).await.unwrap();
        let second = provider.generate(&req, None).await.unwrap();
        assert_eq!(first.text, second.text);
        assert_eq!(first.text, "[offline] hello offline");
        assert_eq!(first.provider, OFFLINE_PROVIDER);
        assert_eq!(first.cost, 0.0);
        assert!(first.tokens_used > 0);
        assert_eq!(first.metadata["deterministic"], true);
    }

    #[tokio::test]
    async fn streaming_matches_non_streaming() {
        let provider = OfflineProvider::new();
        let req = CompletionRequest::from_prompt("stream me a fairly long reply please");

        let full = provider.generate(&req, None).await.unwrap().text;

        let mut stream = provider.generate_streaming(&req, None).await.unwrap();
        let mut fragments = Vec::new();
        while let Some(piece) = stream.next().await {
            fragments.push(piece.unwrap());
        }
        assert!(fragments.len() > 1);
        assert_eq!(fragments.concat(), full);
    }

    #[tokio::test]
    async fn partially_drained_stream_can_be_dropped() {
        let provider = OfflineProvider::new();
        let req = CompletionRequest::from_prompt("some text worth several fragments here");

        let mut stream = provider.generate_streaming(&req, None).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.is_empty());
        drop(stream);
    }

    #[tokio::test]
    async fn validation_still_applies() {
        let provider = OfflineProvider::new();
        let mut req = CompletionRequest::from_prompt("x");
        req.temperature = 9.0;
        assert!(provider.generate(&req, None).await.is_err());
    }

    #[tokio::test]
    async fn health_is_always_healthy() {
        let provider = OfflineProvider::new();
        let report = provider.check_health().await;
        assert!(report.available);
        assert!(report.error.is_none());
    }
}
