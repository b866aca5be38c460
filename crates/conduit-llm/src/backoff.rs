//! Retry with configurable backoff around the non-streaming provider call.
//!
//! Streaming calls are never routed through here: partial output cannot be
//! safely replayed, so a broken stream surfaces to the caller instead.

use std::time::Duration;

use conduit_types::ConduitError;

/// Attempts per provider call, including the first.
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

// ---------------------------------------------------------------------------
// BackoffPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum BackoffPolicy {
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Exponential backoff: base * 2^attempt, capped at max.
    Exponential { base: Duration, max: Duration },
    /// No delay between retries.
    None,
}

impl BackoffPolicy {
    /// Compute the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::Fixed(d) => *d,
            BackoffPolicy::Exponential { base, max } => {
                let millis = base.as_millis() as u64 * 2u64.saturating_pow(attempt as u32);
                Duration::from_millis(millis).min(*max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// execute_with_retry
// ---------------------------------------------------------------------------

/// Run `f` up to `max_attempts` times, sleeping per `policy` between tries.
///
/// Only errors with [`ConduitError::is_retryable`] are retried; terminal
/// errors (auth, validation) surface immediately. The final attempt's error
/// is returned as-is so the upstream message is preserved.
pub async fn execute_with_retry<T, F, Fut>(
    f: F,
    max_attempts: usize,
    policy: &BackoffPolicy,
    provider: &str,
) -> conduit_types::Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = conduit_types::Result<T>>,
{
    let attempts = max_attempts.max(1);
    let mut last_err = None;
    for attempt in 0..attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    provider = %provider,
                    attempt,
                    delay_ms = %delay.as_millis(),
                    error = %e,
                    "Retryable provider error, backing off"
                );
                last_err = Some(e);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| ConduitError::RetriesExhausted {
        provider: provider.to_string(),
        attempts,
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
