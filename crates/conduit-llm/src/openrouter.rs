use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::time::Instant;

use conduit_types::ConduitError;

use crate::backoff::{execute_with_retry, BackoffPolicy, DEFAULT_MAX_ATTEMPTS};
use crate::config::ProviderConfig;
use crate::credentials::decrypt_credential;
use crate::pricing::{estimate_tokens, OPENROUTER_PRICES};
use crate::provider::{build_http_client, transport_error, validate_against, ProviderAdapter};
use crate::sse::{spawn_sse_stream, SseEvent};
use crate::{CompletionRequest, CompletionResponse, CompletionStream, HealthReport, Role};

const PROVIDER: &str = "openrouter";

// ---------------------------------------------------------------------------
// OpenRouterAdapter
// ---------------------------------------------------------------------------

/// Adapter for the OpenRouter aggregator. Speaks the OpenAI-compatible
/// chat wire but routes to many upstream models, so usage reporting and
/// error bodies are less uniform than a first-party API.
#[derive(Debug)]
pub struct OpenRouterAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    default_model: String,
    timeout_ms: u64,
    referer: String,
    title: String,
}

impl OpenRouterAdapter {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: "https://openrouter.ai/api".to_string(),
            default_model: OPENROUTER_PRICES.default_model().to_string(),
            timeout_ms: 120_000,
            referer: "https://github.com/conduit".to_string(),
            title: "conduit".to_string(),
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
                .unwrap_or_else(|| "https://openrouter.ai/api".to_string()),
            default_model: config.default_model.clone(),
            timeout_ms: config.timeout_secs * 1000,
            referer: "https://github.com/conduit".to_string(),
            title: "conduit".to_string(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn request_builder(&self) -> reqwest::RequestBuilder {
        self.client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
    }

    async fn send_once(&self, body: &serde_json::Value) -> conduit_types::Result<serde_json::Value> {
        let resp = self
            .request_builder()
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
// Request translation (contract → OpenRouter JSON)
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
    if stream {
        body["stream"] = json!(true);
    }

    body
}

// ---------------------------------------------------------------------------
// Response translation (OpenRouter JSON → contract)
// ---------------------------------------------------------------------------

struct ParsedCompletion {
    text: String,
    finish_reason: String,
    input_tokens: u64,
    output_tokens: u64,
    usage_reported: bool,
    response_id: String,
}

fn parse_response(body: &serde_json::Value) -> ParsedCompletion {
    let choice = &body["choices"][0];
    let usage = &body["usage"];
    ParsedCompletion {
        text: choice["message"]["content"].as_str().unwrap_or("").to_string(),
        finish_reason: choice["finish_reason"].as_str().unwrap_or("stop").to_string(),
        input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
        output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
        usage_reported: usage.is_object(),
        response_id: body["id"].as_str().unwrap_or("").to_string(),
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn map_error(status: reqwest::StatusCode, body: &str) -> ConduitError {
    let status_u16 = status.as_u16();
    match status_u16 {
        429 => ConduitError::RateLimited {
            provider: PROVIDER.into(),
            retry_after_ms: 1000,
        },
        401 | 403 => ConduitError::AuthError {
            provider: PROVIDER.into(),
        },
        400 | 404 => ConduitError::ProviderError {
            provider: PROVIDER.into(),
            status: status_u16,
            message: normalize_rate_limit_message(&extract_error_message(body)),
            retryable: false,
        },
        500 | 502 | 503 => ConduitError::ProviderError {
            provider: PROVIDER.into(),
            status: status_u16,
            message: normalize_rate_limit_message(&extract_error_message(body)),
            retryable: true,
        },
        _ => ConduitError::ProviderError {
            provider: PROVIDER.into(),
            status: status_u16,
            message: normalize_rate_limit_message(&extract_error_message(body)),
            retryable: false,
        },
    }
}

// Aggregated upstreams produce several error-body shapes: the OpenAI
// nested object, a raw upstream body under error.metadata, or a bare
// string. Walk them in order of specificity.
fn extract_error_message(body: &str) -> String {
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(m) = v["error"]["metadata"]["raw"].as_str() {
            return m.to_string();
        }
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

/// Collapse duplicated "Rate limit exceeded:" prefixes that stack up when
/// an upstream message is re-wrapped at each aggregation hop.
fn normalize_rate_limit_message(message: &str) -> String {
    const PREFIX: &str = "rate limit exceeded:";
    let mut rest = message.trim();
    let mut saw_prefix = false;
    while let Some(head) = rest.get(..PREFIX.len()) {
        if !head.eq_ignore_ascii_case(PREFIX) {
            break;
        }
        saw_prefix = true;
        rest = rest[PREFIX.len()..].trim_start();
    }
    if saw_prefix {
        format!("Rate limit exceeded: {rest}")
    } else {
        message.to_string()
    }
}

// ---------------------------------------------------------------------------
// ProviderAdapter implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl ProviderAdapter for OpenRouterAdapter {
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

        let (input_tokens, output_tokens) = if parsed.usage_reported {
            (parsed.input_tokens, parsed.output_tokens)
        } else {
            (
                (request.prompt_chars() as u64).div_ceil(4),
                estimate_tokens(&parsed.text),
            )
        };
        let tokens_used = input_tokens + output_tokens;
        let cost = self.calculate_cost(&model, input_tokens, output_tokens);

        let mut metadata = HashMap::new();
        metadata.insert("response_id".to_string(), json!(parsed.response_id));
        metadata.insert("input_tokens".to_string(), json!(input_tokens));
        metadata.insert("output_tokens".to_string(), json!(output_tokens));
        metadata.insert("latency_ms".to_string(), json!(latency_ms));
        if !parsed.usage_reported {
            metadata.insert("tokens_estimated".to_string(), json!(true));
        }

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
            .request_builder()
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
        OPENROUTER_PRICES.cost(model, input_tokens, output_tokens)
    }

    async fn check_health(&self) -> HealthReport {
        let mut probe = CompletionRequest::from_prompt("ping");
        probe.max_tokens = 1;
        probe.temperature = 0.0;
        let body = build_request_body(&probe, OPENROUTER_PRICES.cheapest_model(), false);

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
        validate_against(request, OPENROUTER_PRICES.lookup(model))
    }

    fn available_models(&self) -> Vec<String> {
        OPENROUTER_PRICES.model_names()
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
