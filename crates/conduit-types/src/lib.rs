//! Shared error taxonomy for the conduit completion layer.
//!
//! Every subsystem (provider adapters, registry, fallback orchestrator,
//! rate limiter, usage tracker) speaks `ConduitError`, so callers see one
//! error surface regardless of which provider served (or failed) a request.

/// Unified error type for all conduit subsystems.
#[derive(Debug, thiserror::Error)]
pub enum ConduitError {
    // === Provider errors ===
    #[error("Provider {provider} returned HTTP {status}: {message}")]
    ProviderError {
        provider: String,
        status: u16,
        message: String,
        retryable: bool,
    },

    #[error("Rate limited by {provider}, retry after {retry_after_ms}ms")]
    RateLimited {
        provider: String,
        retry_after_ms: u64,
    },

    #[error("Authentication failed for provider {provider}")]
    AuthError { provider: String },

    #[error("Request to {provider} timed out after {timeout_ms}ms")]
    RequestTimeout { provider: String, timeout_ms: u64 },

    #[error("Context length exceeded for {provider}: {message}")]
    ContextLengthExceeded { provider: String, message: String },

    #[error("Retries exhausted for {provider} after {attempts} attempts")]
    RetriesExhausted { provider: String, attempts: usize },

    // === Request validation ===
    #[error("Request validation failed: {0}")]
    ValidationError(String),

    // === Admission control (our own limiter, not an upstream 429) ===
    #[error("Rate limit exceeded for {key}: {message}")]
    RateLimitExceeded { key: String, message: String },

    // === Fallback exhaustion ===
    #[error("All providers unavailable after {attempts} attempts: {last_error}")]
    PlatformUnavailable { attempts: usize, last_error: String },

    // === Budget ceilings (enforced by callers, never raised internally) ===
    #[error("Cost limit of ${limit_usd} exceeded: projected ${projected_usd}")]
    CostLimitExceeded { limit_usd: f64, projected_usd: f64 },

    #[error("Token limit of {limit} exceeded: requested {requested}")]
    TokenLimitExceeded { limit: u64, requested: u64 },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl ConduitError {
    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConduitError::RateLimited { .. }
                | ConduitError::RequestTimeout { .. }
                | ConduitError::ProviderError {
                    retryable: true,
                    ..
                }
        )
    }

    /// Returns `true` if the error is permanent and retrying will not help.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConduitError::AuthError { .. }
                | ConduitError::ValidationError(_)
                | ConduitError::ContextLengthExceeded { .. }
                | ConduitError::CostLimitExceeded { .. }
                | ConduitError::TokenLimitExceeded { .. }
        )
    }

    /// Maps the error to an HTTP status code for embedding surfaces.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            ConduitError::RateLimited { .. } | ConduitError::RateLimitExceeded { .. } => Some(429),
            ConduitError::AuthError { .. } => Some(401),
            ConduitError::ProviderError { status, .. } => Some(*status),
            ConduitError::RequestTimeout { .. } => Some(504),
            ConduitError::ValidationError(_) => Some(400),
            ConduitError::ContextLengthExceeded { .. } => Some(413),
            ConduitError::PlatformUnavailable { .. } => Some(503),
            ConduitError::CostLimitExceeded { .. } | ConduitError::TokenLimitExceeded { .. } => {
                Some(402)
            }
            _ => None,
        }
    }
}

/// A convenience alias for `Result<T, ConduitError>`.
pub type Result<T> = std::result::Result<T, ConduitError>;
