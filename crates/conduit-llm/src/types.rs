use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

// ---------------------------------------------------------------------------
// ChatMessage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// CompletionRequest
// ---------------------------------------------------------------------------

/// Provider-agnostic completion request.
///
/// Exactly one of `prompt` and `messages` drives the outbound message
/// construction; when both are set, `messages` takes precedence and the
/// prompt is appended as a final user turn (see [`conversation`]).
///
/// [`conversation`]: CompletionRequest::conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: Option<String>,
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
    pub user_id: Option<String>,
}

impl CompletionRequest {
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            system_prompt: None,
            messages: Vec::new(),
            temperature: 1.0,
            max_tokens: 1024,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            stop_sequences: Vec::new(),
            user_id: None,
        }
    }

    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        Self {
            prompt: None,
            system_prompt: None,
            messages,
            temperature: 1.0,
            max_tokens: 1024,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            stop_sequences: Vec::new(),
            user_id: None,
        }
    }

    /// The outbound conversation, excluding the system prompt.
    ///
    /// The message list wins over the bare prompt; a request carrying both
    /// gets the prompt appended as a trailing user turn.
    pub fn conversation(&self) -> Vec<ChatMessage> {
        let mut turns: Vec<ChatMessage> = self
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect();
        if let Some(ref prompt) = self.prompt {
            turns.push(ChatMessage::user(prompt.clone()));
        }
        turns
    }

    /// System text for providers that frame it separately: the explicit
    /// `system_prompt` plus any system-role turns in the message list.
    pub fn system_text(&self) -> Option<String> {
        let mut parts: Vec<&str> = Vec::new();
        if let Some(ref sys) = self.system_prompt {
            parts.push(sys);
        }
        for msg in &self.messages {
            if msg.role == Role::System {
                parts.push(&msg.content);
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    /// Total characters across every outbound text, for token estimation.
    pub fn prompt_chars(&self) -> usize {
        let system: usize = self.system_text().map(|s| s.chars().count()).unwrap_or(0);
        let turns: usize = self
            .conversation()
            .iter()
            .map(|m| m.content.chars().count())
            .sum();
        system + turns
    }
}

// ---------------------------------------------------------------------------
// CompletionResponse
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub text: String,
    /// Logical model name the caller asked for, echoed back.
    pub model: String,
    /// Provider that actually served the request.
    pub provider: String,
    pub tokens_used: u64,
    /// USD. Always >= 0; 0.0 for free-tier models and the offline provider.
    pub cost: f64,
    pub finish_reason: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Health report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub latency_ms: u64,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            status: HealthStatus::Healthy,
            latency_ms,
            available: true,
            error: None,
        }
    }

    pub fn unhealthy(latency_ms: u64, error: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            latency_ms,
            available: false,
            error: Some(error.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Attempt trail
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded { tokens: u64, cost: f64 },
    Failed { error: String },
    Skipped { reason: String },
}

/// One entry per provider tried for a logical request, in attempt order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub provider: String,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

// ---------------------------------------------------------------------------
// CompletionStream
// ---------------------------------------------------------------------------

/// Lazy sequence of generated text fragments. Finite, not restartable;
/// dropping it cancels the underlying transport.
pub type CompletionStream =
    Pin<Box<dyn Stream<Item = conduit_types::Result<String>> + Send>>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
