use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::time::Instant;

use conduit_types::ConduitError;

use crate::backoff::{execute_with_retry, BackoffPolicy, DEFAULT_MAX_ATTEMPTS};
use crate::config::ProviderConfig;
use crate::credentials::decrypt_credential;
use crate::pricing::{estimate_tokens, GEMINI_PRICES};
use crate::provider::{build_http_client, transport_error, validate_against, ProviderAdapter};
use crate::sse::{spawn_sse_stream, SseEvent};
use crate::{CompletionRequest, CompletionResponse, CompletionStream, HealthReport, Role};

const PROVIDER: &str = "gemini";

// ---------------------------------------------------------------------------
// GeminiAdapter
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct GeminiAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    default_model: String,
    timeout_ms: u64,
}

impl GeminiAdapter {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            default_model: GEMINI_PRICES.default_model().to_string(),
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
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            default_model: config.default_model.clone(),
            timeout_ms: config.timeout_secs * 1000,
        })
    }

    fn endpoint(&self, model: &str, stream: bool) -> String {
        if stream {
            format!(
                "{}/models/{}:streamGenerateContent?alt=sse&key={}",
                self.base_url, model, self.api_key
            )
        } else {
            format!(
                "{}/models/{}:generateContent?key={}",
                self.base_url, model, self.api_key
            )
        }
    }

    async fn send_once(
        &self,
        model: &str,
        body: &serde_json::Value,
    ) -> conduit_types::Result<serde_json::Value> {
        let resp = self
            .client
            .post(self.endpoint(model, false))
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
// Request translation (contract → Gemini JSON)
// ---------------------------------------------------------------------------

// Gemini frames turns as `contents` with role "user"/"model" and carries
// the system text in `systemInstruction`; sampling knobs live under
// `generationConfig`.
fn build_request_body(request: &CompletionRequest, _model: &str) -> serde_json::Value {
    let contents: Vec<serde_json::Value> = request
        .conversation()
        .iter()
        .map(|turn| {
            let role = match turn.role {
                Role::Assistant => "model",
                Role::User | Role::System => "user",
            };
            json!({ "role": role, "parts": [{ "text": turn.content }] })
        })
        .collect();

    let mut body = json!({ "contents": contents });

    if let Some(system) = request.system_text() {
        body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
    }

    let mut gen_config = json!({
        "maxOutputTokens": request.max_tokens,
        "temperature": request.temperature,
    });
    if let Some(top_p) = request.top_p {
        gen_config["topP"] = json!(top_p);
    }
    if let Some(p) = request.frequency_penalty {
        gen_config["frequencyPenalty"] = json!(p);
    }
    if let Some(p) = request.presence_penalty {
        gen_config["presencePenalty"] = json!(p);
    }
    if !request.stop_sequences.is_empty() {
        gen_config["stopSequences"] = json!(request.stop_sequences);
    }
    body["generationConfig"] = gen_config;

    body
}

// ---------------------------------------------------------------------------
// Response translation (Gemini JSON → contract)
// ---------------------------------------------------------------------------

struct ParsedCompletion {
    text: String,
    finish_reason: String,
    input_tokens: u64,
    output_tokens: u64,
    usage_reported: bool,
}

fn parse_response(body: &serde_json::Value) -> ParsedCompletion {
    let candidate = &body["candidates"][0];

    let mut text_parts: Vec<String> = Vec::new();
    if let Some(parts) = candidate["content"]["parts"].as_array() {
        for part in parts {
            if let Some(t) = part["text"].as_str() {
                text_parts.push(t.to_string());
            }
        }
    }

    let usage = &body["usageMetadata"];
    let usage_reported = usage.is_object();

    ParsedCompletion {
        text: text_parts.join(""),
        finish_reason: candidate["finishReason"]
            .as_str()
            .unwrap_or("STOP")
            .to_lowercase(),
        input_tokens: usage["promptTokenCount"].as_u64().unwrap_or(0),
        output_tokens: usage["candidatesTokenCount"].as_u64().unwrap_or(0),
        usage_reported,
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
        400 => ConduitError::ProviderError {
            provider: PROVIDER.into(),
            status: 400,
            message: extract_error_message(body),
            retryable: false,
        },
        500 | 503 => ConduitError::ProviderError {
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
        if let Some(m) = v["error"]["status"].as_str() {
            return m.to_string();
        }
    }
    body.to_string()
}

// ---------------------------------------------------------------------------
// ProviderAdapter implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    async fn generate(
        &self,
        request: &CompletionRequest,
        model_override: Option<&str>,
    ) -> conduit_types::Result<CompletionResponse> {
        let model = model_override.unwrap_or(&self.default_model).to_string();
        self.validate_request(request, &model)?;

        let body = build_request_body(request, &model);
        let started = Instant::now();
        let raw = execute_with_retry(
            || self.send_once(&model, &body),
            DEFAULT_MAX_ATTEMPTS,
            &BackoffPolicy::default(),
            PROVIDER,
        )
        .await?;
        let latency_ms = started.elapsed().as_millis() as u64;

        let parsed = parse_response(&raw);

        // No usage object means estimated counts: chars / 4, labeled so
        // downstream accounting knows these are not exact.
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

        let body = build_request_body(request, &model);
        let resp = self
            .client
            .post(self.endpoint(&model, true))
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
            match serde_json::from_str::<serde_json::Value>(data) {
                Ok(v) => {
                    match v["candidates"][0]["content"]["parts"][0]["text"].as_str() {
                        Some(text) => SseEvent::Fragment(text.to_string()),
                        None => SseEvent::Ignore,
                    }
                }
                Err(_) => SseEvent::Ignore,
            }
        }))
    }

    fn calculate_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        GEMINI_PRICES.cost(model, input_tokens, output_tokens)
    }

    async fn check_health(&self) -> HealthReport {
        let mut probe = CompletionRequest::from_prompt("ping");
        probe.max_tokens = 1;
        probe.temperature = 0.0;
        let model = GEMINI_PRICES.cheapest_model();
        let body = build_request_body(&probe, model);

        let started = Instant::now();
        let result = self.send_once(model, &body).await;
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
        validate_against(request, GEMINI_PRICES.lookup(model))
    }

    fn available_models(&self) -> Vec<String> {
        GEMINI_PRICES.model_names()
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
