use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::time::Instant;

use conduit_types::ConduitError;

use crate::backoff::{execute_with_retry, BackoffPolicy, DEFAULT_MAX_ATTEMPTS};
use crate::config::ProviderConfig;
use crate::credentials::decrypt_credential;
use crate::pricing::ANTHROPIC_PRICES;
use crate::provider::{build_http_client, transport_error, validate_against, ProviderAdapter};
use crate::sse::{spawn_sse_stream, SseEvent};
use crate::{CompletionRequest, CompletionResponse, CompletionStream, HealthReport, Role};

const PROVIDER: &str = "anthropic";
const API_VERSION: &str = "2023-06-01";

// ---------------------------------------------------------------------------
// AnthropicAdapter
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AnthropicAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    default_model: String,
    timeout_ms: u64,
}

impl AnthropicAdapter {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: "https://api.anthropic.com".to_string(),
            default_model: ANTHROPIC_PRICES.default_model().to_string(),
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
                .unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            default_model: config.default_model.clone(),
            timeout_ms: config.timeout_secs * 1000,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    async fn send_once(&self, body: &serde_json::Value) -> conduit_types::Result<serde_json::Value> {
        let resp = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
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
// Request translation (contract → Anthropic JSON)
// ---------------------------------------------------------------------------

// System text rides in the top-level `system` field; the messages array
// carries only user/assistant turns. Penalty knobs have no Anthropic
// equivalent and are dropped.
fn build_request_body(
    request: &CompletionRequest,
    model: &str,
    stream: bool,
) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = request
        .conversation()
        .iter()
        .map(|turn| {
            let role = match turn.role {
                Role::Assistant => "assistant",
                Role::User | Role::System => "user",
            };
            json!({ "role": role, "content": turn.content })
        })
        .collect();

    let mut body = json!({
        "model": model,
        "max_tokens": request.max_tokens,
        "messages": messages,
        "temperature": request.temperature,
    });

    if let Some(system) = request.system_text() {
        body["system"] = json!(system);
    }
    if let Some(top_p) = request.top_p {
        body["top_p"] = json!(top_p);
    }
    if !request.stop_sequences.is_empty() {
        body["stop_sequences"] = json!(request.stop_sequences);
    }
    if let Some(ref user) = request.user_id {
        body["metadata"] = json!({ "user_id": user });
    }
    if stream {
        body["stream"] = json!(true);
    }

    body
}

// ---------------------------------------------------------------------------
// Response translation (Anthropic JSON → contract)
// ---------------------------------------------------------------------------

struct ParsedCompletion {
    text: String,
    finish_reason: String,
    input_tokens: u64,
    output_tokens: u64,
    response_id: String,
}

fn parse_response(body: &serde_json::Value) -> ParsedCompletion {
    let mut text_parts: Vec<String> = Vec::new();
    if let Some(content) = body["content"].as_array() {
        for block in content {
            if block["type"] == "text" {
                if let Some(t) = block["text"].as_str() {
                    text_parts.push(t.to_string());
                }
            }
        }
    }

    ParsedCompletion {
        text: text_parts.join(""),
        finish_reason: body["stop_reason"].as_str().unwrap_or("end_turn").to_string(),
        input_tokens: body["usage"]["input_tokens"].as_u64().unwrap_or(0),
        output_tokens: body["usage"]["output_tokens"].as_u64().unwrap_or(0),
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
            if message.contains("prompt is too long") || message.contains("context window") {
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
        // 529 is Anthropic's "overloaded" status, transient by definition.
        500 | 529 => ConduitError::ProviderError {
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
impl ProviderAdapter for AnthropicAdapter {
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
        let tokens_used = parsed.input_tokens + parsed.output_tokens;
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
            tokens_used,
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
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
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
            match serde_json::from_str::<serde_json::Value>(data) {
                Ok(v) => match v["type"].as_str() {
                    Some("content_block_delta") => match v["delta"]["text"].as_str() {
                        Some(text) => SseEvent::Fragment(text.to_string()),
                        None => SseEvent::Ignore,
                    },
                    Some("message_stop") => SseEvent::Done,
                    _ => SseEvent::Ignore,
                },
                Err(_) => SseEvent::Ignore,
            }
        }))
    }

    fn calculate_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        ANTHROPIC_PRICES.cost(model, input_tokens, output_tokens)
    }

    async fn check_health(&self) -> HealthReport {
        let mut probe = CompletionRequest::from_prompt("ping");
        probe.max_tokens = 1;
        probe.temperature = 0.0;
        let body = build_request_body(&probe, ANTHROPIC_PRICES.cheapest_model(), false);

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
        validate_against(request, ANTHROPIC_PRICES.lookup(model))
    }

    fn available_models(&self) -> Vec<String> {
        ANTHROPIC_PRICES.model_names()
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
