use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::time::Instant;

use conduit_types::ConduitError;

use crate::backoff::{execute_with_retry, BackoffPolicy, DEFAULT_MAX_ATTEMPTS};
use crate::config::ProviderConfig;
use crate::credentials::decrypt_credential;
use crate::pricing::OPENAI_PRICES;
use crate::provider::{build_http_client, transport_error, validate_against, ProviderAdapter};
use crate::sse::{spawn_sse_stream, SseEvent};
use crate::{CompletionRequest, CompletionResponse, CompletionStream, HealthReport, Role};

const PROVIDER: &str = "openai";

// ---------------------------------------------------------------------------
// OpenAiAdapter
// ---------------------------------------------------------------------------

/// Adapter for the OpenAI chat completions API and compatible servers.
#[derive(Debug)]
pub struct OpenAiAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    default_model: String,
    timeout_ms: u64,
}

impl OpenAiAdapter {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: "https://api.openai.com".to_string(),
            default_model: OPENAI_PRICES.default_model().to_string(),
            timeout_ms: 120_000,
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    pub fn from_config(config: &ProviderConfig, secret: &str) -> conduit_types::Result<Self> {
        let api_key = decrypt_credential(&config.credential, secret)?;
        let client = build_http_client(config.timeout_secs, config.connect_timeout_secs)?;
        Ok(Self {
            client,
            api_key,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            default_model: config.default_model.clone(),
            timeout_ms: config.timeout_secs * 1000,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    async fn send_once(&self, body: &serde_json::Value) -> conduit_types::Result<serde_json::Value> {
        let resp = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, self.timeout_ms, e))?;

        let status = resp.status();
        let response_body = resp
            .text()
            .await
            .map_err(|e| transport_error(PROVIDER, self.timeout_ms, e))?;

        if !status.is_success() {
            return Err(map_error(status, &response_body));
        }

        serde_json::from_str(&response_body).map_err(|e| ConduitError::ProviderError {
            provider: PROVIDER.into(),
            status: status.as_u16(),
            message: format!("Failed to parse response JSON: {e}"),
            retryable: false,
        })
    }
}

// ---------------------------------------------------------------------------
// Request translation (contract → OpenAI JSON)
// ---------------------------------------------------------------------------

fn build_request_body(
    request: &CompletionRequest,
    model: &str,
    stream: bool,
) -> serde_json::Value {
    let mut messages: Vec<serde_json::Value> = Vec::new();

    if let Some(system) = request.system_text() {
        messages.push(json!({ "role": "system", "content": system }));
    }
    for turn in request.conversation() {
        let role = match turn.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        messages.push(json!({ "role": role, "content": turn.content }));
    }

    let mut body = json!({
        "model": model,
        "messages": messages,
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
    });

    if let Some(top_p) = request.top_p {
        body["top_p"] = json!(top_p);
    }
    if let Some(p) = request.frequency_penalty {
        body["frequency_penalty"] = json!(p);
    }
    if let Some(p) = request.presence_penalty {
        body["presence_penalty"] = json!(p);
    }
    if !request.stop_sequences.is_empty() {
        body["stop"] = json!(request.stop_sequences);
    }
    if let Some(ref user) = request.user_id {
        body["user"] = json!(user);
    }
    if stream {
        body["stream"] = json!(true);
    }

    body
}

// ---------------------------------------------------------------------------
// Response translation (OpenAI JSON → contract)
// ---------------------------------------------------------------------------

struct ParsedCompletion {
    text: String,
    finish_reason: String,
    input_tokens: u64,
    output_tokens: u64,
    total_tokens: u64,
    response_id: String,
}

fn parse_response(body: &serde_json::Value) -> ParsedCompletion {
    let choice = &body["choices"][0];
    let input_tokens = body["usage"]["prompt_tokens"].as_u64().unwrap_or(0);
    let output_tokens = body["usage"]["completion_tokens"].as_u64().unwrap_or(0);
    ParsedCompletion {
        text: choice["message"]["content"].as_str().unwrap_or("").to_string(),
        finish_reason: choice["finish_reason"].as_str().unwrap_or("stop").to_string(),
        input_tokens,
        output_tokens,
        total_tokens: body["usage"]["total_tokens"]
            .as_u64()
            .unwrap_or(input_tokens + output_tokens),
        response_id: body["id"].as_str().unwrap_or("").to_string(),
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn map_error(status: reqwest::StatusCode, body: &str) -> ConduitError {
    let status_u16 = status.as_u16();
    match status_u16 {
        429 => {
            let retry_ms = serde_json::from_str::<serde_json::Value>(body)
                .ok()
                .and_then(|v| v["error"]["retry_after"].as_f64())
                .map(|s| (s * 1000.0) as u64)
                .unwrap_or(1000);
            ConduitError::RateLimited {
                provider: PROVIDER.into(),
                retry_after_ms: retry_ms,
            }
        }
        401 | 403 => ConduitError::AuthError {
            provider: PROVIDER.into(),
        },
        400 => {
            let message = extract_error_message(body);
            let code = serde_json::from_str::<serde_json::Value>(body)
                .ok()
                .and_then(|v| v["error"]["code"].as_str().map(String::from));
            if code.as_deref() == Some("context_length_exceeded") {
                ConduitError::ContextLengthExceeded {
                    provider: PROVIDER.into(),
                    message,
                }
            } else {
                ConduitError::ProviderError {
                    provider: PROVIDER.into(),
                    status: 400,
                    message,
                    retryable: false,
                }
            }
        }
        500 | 502 | 503 => ConduitError::ProviderError {
            provider: PROVIDER.into(),
            status: status_u16,
            message: extract_error_message(body),
            retryable: true,
        },
        _ => ConduitError::ProviderError {
            provider: PROVIDER.into(),
            status: status_u16,
            message: extract_error_message(body),
            retryable: false,
        },
    }
}

// Error bodies arrive in several shapes; prefer the nested message, fall
// back to the raw body.
fn extract_error_message(body: &str) -> String {
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(m) = v["error"]["message"].as_str() {
            return m.to_string();
        }
        if let Some(m) = v["error"].as_str() {
            return m.to_string();
        }
        if let Some(m) = v["message"].as_str() {
            return m.to_string();
        }
    }
    body.to_string()
}

// ---------------------------------------------------------------------------
// ProviderAdapter implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    async fn generate(
        &self,
        request: &CompletionRequest,
        model_override: Option<&str>,
    ) -> conduit_types::Result<CompletionResponse> {
        let model = model_override.unwrap_or(&self.default_model).to_string();
        self.validate_request(request, &model)?;

        let body = build_request_body(request, &model, false);
        let started = Instant::now();
        let raw = execute_with_retry(
            || self.send_once(&body),
            DEFAULT_MAX_ATTEMPTS,
            &BackoffPolicy::default(),
            PROVIDER,
        )
        .await?;
        let latency_ms = started.elapsed().as_millis() as u64;

        let parsed = parse_response(&raw);
        let cost = self.calculate_cost(&model, parsed.input_tokens, parsed.output_tokens);

        let mut metadata = HashMap::new();
        metadata.insert("response_id".to_string(), json!(parsed.response_id));
        metadata.insert("input_tokens".to_string(), json!(parsed.input_tokens));
        metadata.insert("output_tokens".to_string(), json!(parsed.output_tokens));
        metadata.insert("latency_ms".to_string(), json!(latency_ms));

        Ok(CompletionResponse {
            text: parsed.text,
            model,
            provider: PROVIDER.into(),
            tokens_used: parsed.total_tokens,
            cost,
            finish_reason: parsed.finish_reason,
            metadata,
        })
    }

    async fn generate_streaming(
        &self,
        request: &CompletionRequest,
        model_override: Option<&str>,
    ) -> conduit_types::Result<CompletionStream> {
        let model = model_override.unwrap_or(&self.default_model).to_string();
        self.validate_request(request, &model)?;

        let body = build_request_body(request, &model, true);
        let resp = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, self.timeout_ms, e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp
                .text()
                .await
                .map_err(|e| transport_error(PROVIDER, self.timeout_ms, e))?;
            return Err(map_error(status, &text));
        }

        Ok(spawn_sse_stream(resp, PROVIDER, |data| {
            if data == "[DONE]" {
                return SseEvent::Done;
            }
            match serde_json::from_str::<serde_json::Value>(data) {
                Ok(v) => match v["choices"][0]["delta"]["content"].as_str() {
                    Some(text) => SseEvent::Fragment(text.to_string()),
                    None => SseEvent::Ignore,
                },
                Err(_) => SseEvent::Ignore,
            }
        }))
    }

    fn calculate_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        OPENAI_PRICES.cost(model, input_tokens, output_tokens)
    }

    async fn check_health(&self) -> HealthReport {
        let mut probe = CompletionRequest::from_prompt("ping");
        probe.max_tokens = 1;
        probe.temperature = 0.0;
        let body = build_request_body(&probe, OPENAI_PRICES.cheapest_model(), false);

        let started = Instant::now();
        let result = self.send_once(&body).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(_) => HealthReport::healthy(latency_ms),
            Err(e) => HealthReport::unhealthy(latency_ms, e.to_string()),
        }
    }

    fn validate_request(
        &self,
        request: &CompletionRequest,
        model: &str,
    ) -> conduit_types::Result<()> {
        validate_against(request, OPENAI_PRICES.lookup(model))
    }

    fn available_models(&self) -> Vec<String> {
        OPENAI_PRICES.model_names()
    }

    fn name(&self) -> &str {
        PROVIDER
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::encrypt_credential;
    use crate::ChatMessage;

    fn basic_request() -> CompletionRequest {
        let mut req = CompletionRequest::from_prompt("Hello");
        req.system_prompt = Some("You are helpful.".into());
        req.temperature = 0.7;
        req.max_tokens = 256;
        req
    }

    #[test]
    fn build_request_body_frames_full_message_array() {
        let mut req = basic_request();
        req.messages = vec![
            ChatMessage::user("earlier question"),
            ChatMessage::assistant("earlier answer"),
        ];

        let body = build_request_body(&req, "gpt-4o-mini", false);
        assert_eq!(body["model"], "gpt-4o-mini");

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "You are helpful.");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[2]["role"], "assistant");
        // Prompt appended after the history.
        assert_eq!(messages[3]["role"], "user");
        assert_eq!(messages[3]["content"], "Hello");

        assert_eq!(body["max_tokens"], 256);
        assert!(body.get("stream").is_none() || body["stream"].is_null());
    }

    #[test]
    fn build_request_body_optional_knobs() {
        let mut req = basic_request();
        req.top_p = Some(0.9);
        req.frequency_penalty = Some(0.5);
        req.presence_penalty = Some(-0.5);
        req.stop_sequences = vec!["END".into()];
        req.user_id = Some("user-7".into());

        let body = build_request_body(&req, "gpt-4o", true);
        assert!((body["top_p"].as_f64().unwrap() - 0.9).abs() < 0.01);
        assert!((body["frequency_penalty"].as_f64().unwrap() - 0.5).abs() < 0.01);
        assert_eq!(body["stop"][0], "END");
        assert_eq!(body["user"], "user-7");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn parse_response_reads_exact_usage() {
        let raw = json!({
            "id": "chatcmpl-123",
            "model": "gpt-4o-mini",
            "choices": [{
                "message": { "role": "assistant", "content": "Hi there!" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 4, "total_tokens": 16 }
        });
        let parsed = parse_response(&raw);
        assert_eq!(parsed.text, "Hi there!");
        assert_eq!(parsed.finish_reason, "stop");
        assert_eq!(parsed.input_tokens, 12);
        assert_eq!(parsed.output_tokens, 4);
        assert_eq!(parsed.total_tokens, 16);
        assert_eq!(parsed.response_id, "chatcmpl-123");
    }

    #[test]
    fn parse_response_sums_when_total_missing() {
        let raw = json!({
            "choices": [{ "message": { "content": "x" }, "finish_reason": "length" }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 5 }
        });
        let parsed = parse_response(&raw);
        assert_eq!(parsed.total_tokens, 15);
        assert_eq!(parsed.finish_reason, "length");
    }

    #[test]
    fn error_mapping_429_rate_limited() {
        let err = map_error(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            r#"{"error": {"message": "rate limited", "retry_after": 2.0}}"#,
        );
        assert!(matches!(
            err,
            ConduitError::RateLimited {
                retry_after_ms: 2000,
                ..
            }
        ));
    }

    #[test]
    fn error_mapping_auth_and_server() {
        assert!(matches!(
            map_error(reqwest::StatusCode::UNAUTHORIZED, "{}"),
            ConduitError::AuthError { .. }
        ));
        match map_error(
            reqwest::StatusCode::BAD_GATEWAY,
            r#"{"error": {"message": "bad gateway"}}"#,
        ) {
            ConduitError::ProviderError {
                retryable, status, ..
            } => {
                assert!(retryable);
                assert_eq!(status, 502);
            }
            other => panic!("expected ProviderError, got {other:?}"),
        }
    }

    #[test]
    fn error_mapping_context_length() {
        let err = map_error(
            reqwest::StatusCode::BAD_REQUEST,
            r#"{"error": {"message": "too long", "code": "context_length_exceeded"}}"#,
        );
        assert!(matches!(err, ConduitError::ContextLengthExceeded { .. }));
    }

    #[test]
    fn extract_error_message_handles_alternate_shapes() {
        assert_eq!(
            extract_error_message(r#"{"error": {"message": "nested"}}"#),
            "nested"
        );
        assert_eq!(extract_error_message(r#"{"error": "flat"}"#), "flat");
        assert_eq!(extract_error_message(r#"{"message": "bare"}"#), "bare");
        assert_eq!(extract_error_message("plain text body"), "plain text body");
    }

    #[tokio::test]
    async fn validation_rejects_before_any_network_call() {
        // Unroutable base URL: a network attempt would surface as a
        // transport error, not a validation error.
        let adapter =
            OpenAiAdapter::new("test-key".into()).with_base_url("http://invalid.localdomain".into());
        let mut req = basic_request();
        req.temperature = 5.0;
        let err = adapter.generate(&req, None).await.unwrap_err();
        assert!(matches!(err, ConduitError::ValidationError(_)));
    }

    #[test]
    fn from_config_decrypts_credential() {
        let secret = "proc-secret";
        let mut config = ProviderConfig::new(PROVIDER, "gpt-4o-mini");
        config.credential = encrypt_credential("sk-live-abc", secret);
        config.base_url = Some("https://proxy.internal".into());

        let adapter = OpenAiAdapter::from_config(&config, secret).unwrap();
        assert_eq!(adapter.api_key, "sk-live-abc");
        assert_eq!(adapter.base_url, "https://proxy.internal");
        assert_eq!(adapter.default_model(), "gpt-4o-mini");
    }

    #[test]
    fn cost_delegates_to_table() {
        let adapter = OpenAiAdapter::new("k".into());
        let cost = adapter.calculate_cost("gpt-4o", 1000, 500);
        assert!((cost - 0.0075).abs() < 1e-12);
        assert_eq!(cost, adapter.calculate_cost("gpt-4o", 1000, 500));
    }
}
