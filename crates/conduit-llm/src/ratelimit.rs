//! Sliding-window rate limiting in front of the provider adapters.
//!
//! Two interchangeable backends sit behind one contract: a redis
//! sorted-set store for multi-process deployments and an in-process map
//! for single-process or test use. The facade fails open on backend
//! errors: an infrastructure fault must not block completion traffic.
//! That availability-over-strictness tradeoff is deliberate; do not
//! tighten it to fail closed.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

use conduit_types::ConduitError;

use crate::config::ProviderConfig;

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Prune events older than the window, count what remains, and record
    /// the new event only if the count is still under `max_requests`.
    async fn check_rate_limit(
        &self,
        key: &str,
        max_requests: u32,
        window_secs: u64,
    ) -> conduit_types::Result<RateLimitDecision>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Map-of-timestamp-lists fallback for single-process deployments. The
/// whole check-and-record runs inside one critical section, so it holds
/// under multi-threaded runtimes, not just cooperative scheduling.
#[derive(Default)]
pub struct InMemoryRateLimitStore {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn check_rate_limit(
        &self,
        key: &str,
        max_requests: u32,
        window_secs: u64,
    ) -> conduit_types::Result<RateLimitDecision> {
        let now = Instant::now();
        let window = Duration::from_secs(window_secs);

        let mut guard = self.windows.lock().await;
        let entries = guard.entry(key.to_string()).or_default();
        while let Some(front) = entries.front() {
            if now.duration_since(*front) >= window {
                entries.pop_front();
            } else {
                break;
            }
        }

        let count = entries.len() as u32;
        if count < max_requests {
            entries.push_back(now);
            Ok(RateLimitDecision {
                allowed: true,
                remaining: max_requests - count - 1,
            })
        } else {
            Ok(RateLimitDecision {
                allowed: false,
                remaining: 0,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Redis backend
// ---------------------------------------------------------------------------

/// Sorted-set sliding window shared across processes: remove-by-score to
/// prune, cardinality to count, add-with-score plus expiry to record.
pub struct RedisRateLimitStore {
    client: redis::Client,
}

impl RedisRateLimitStore {
    pub fn new(connection_string: &str) -> conduit_types::Result<Self> {
        let client = redis::Client::open(connection_string)
            .map_err(|e| ConduitError::Other(format!("Failed to create redis client: {e}")))?;
        Ok(Self { client })
    }

    async fn connection(&self) -> conduit_types::Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ConduitError::Other(format!("Failed to get redis connection: {e}")))
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn check_rate_limit(
        &self,
        key: &str,
        max_requests: u32,
        window_secs: u64,
    ) -> conduit_types::Result<RateLimitDecision> {
        let mut conn = self.connection().await?;
        let now_ms = chrono::Utc::now().timestamp_millis();
        let cutoff = now_ms - (window_secs as i64) * 1000;

        let (count,): (u32,) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(cutoff)
            .ignore()
            .cmd("ZCARD")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| ConduitError::Other(format!("redis rate limit check failed: {e}")))?;

        if count >= max_requests {
            return Ok(RateLimitDecision {
                allowed: false,
                remaining: 0,
            });
        }

        // Member must be unique per event; two admissions in the same
        // millisecond would otherwise collapse into one.
        let member = format!("{now_ms}-{}", uuid::Uuid::new_v4());
        let _: () = redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(key)
            .arg(now_ms)
            .arg(&member)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(window_secs)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| ConduitError::Other(format!("redis rate limit record failed: {e}")))?;

        Ok(RateLimitDecision {
            allowed: true,
            remaining: max_requests - count - 1,
        })
    }
}

// ---------------------------------------------------------------------------
// RateLimiter facade
// ---------------------------------------------------------------------------

pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryRateLimitStore::new()))
    }

    /// Backend errors admit the request (fail open) rather than blocking
    /// traffic on an infrastructure fault.
    pub async fn check_rate_limit(
        &self,
        key: &str,
        max_requests: u32,
        window_secs: u64,
    ) -> RateLimitDecision {
        match self
            .store
            .check_rate_limit(key, max_requests, window_secs)
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                warn!(key = %key, error = %e, "Rate limit backend error, failing open");
                RateLimitDecision {
                    allowed: true,
                    remaining: max_requests,
                }
            }
        }
    }

    /// `provider:{name}:user:{id}` when a user is known, else
    /// `provider:{name}:global`.
    pub fn platform_key(provider: &str, user_id: Option<&str>) -> String {
        match user_id {
            Some(id) => format!("provider:{provider}:user:{id}"),
            None => format!("provider:{provider}:global"),
        }
    }

    /// Apply the provider's configured per-minute ceiling.
    pub async fn check_platform_limit(
        &self,
        config: &ProviderConfig,
        user_id: Option<&str>,
    ) -> RateLimitDecision {
        let key = Self::platform_key(&config.provider, user_id);
        self.check_rate_limit(&key, config.requests_per_minute, 60)
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
