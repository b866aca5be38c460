//! Usage ledger and cost tracking.
//!
//! One record per attempt: a fallback sweep that fails twice before
//! succeeding writes three records. Tracking never propagates errors to
//! the completion path; a broken ledger degrades to a logged skip.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::offline::OFFLINE_PROVIDER;
use crate::CompletionResponse;

// ---------------------------------------------------------------------------
// UsageRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub provider: String,
    pub model: String,
    pub tokens: u64,
    pub cost: f64,
    pub success: bool,
    pub error: Option<String>,
    pub response_time_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProviderTotals {
    pub requests: u64,
    pub tokens: u64,
    pub cost: f64,
    pub failures: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_cost: f64,
    pub total_tokens: u64,
    pub total_requests: u64,
    pub avg_response_time_secs: f64,
}

// ---------------------------------------------------------------------------
// UsageStore
// ---------------------------------------------------------------------------

/// Append-only persistence for usage records, consumed by external
/// billing/reporting surfaces.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn append(&self, record: UsageRecord) -> conduit_types::Result<()>;

    async fn records_for_user(
        &self,
        user_id: &str,
        provider: Option<&str>,
    ) -> conduit_types::Result<Vec<UsageRecord>>;
}

#[derive(Default)]
pub struct InMemoryUsageStore {
    records: RwLock<Vec<UsageRecord>>,
}

impl InMemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all_records(&self) -> Vec<UsageRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn append(&self, record: UsageRecord) -> conduit_types::Result<()> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn records_for_user(
        &self,
        user_id: &str,
        provider: Option<&str>,
    ) -> conduit_types::Result<Vec<UsageRecord>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|r| r.user_id.as_deref() == Some(user_id))
            .filter(|r| provider.map_or(true, |p| r.provider == p))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// UsageTracker
// ---------------------------------------------------------------------------

pub struct UsageTracker {
    store: Arc<dyn UsageStore>,
    totals: RwLock<HashMap<String, ProviderTotals>>,
}

impl UsageTracker {
    pub fn new(store: Arc<dyn UsageStore>) -> Self {
        Self {
            store,
            totals: RwLock::new(HashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryUsageStore::new()))
    }

    /// Record a successful attempt and bump the provider's running totals.
    /// No-op for the offline provider, which has no backing configuration.
    pub async fn track_completion(&self, response: &CompletionResponse, user_id: Option<&str>) {
        if response.provider == OFFLINE_PROVIDER {
            debug!("Skipping usage tracking for offline provider");
            return;
        }

        let response_time_ms = response
            .metadata
            .get("latency_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        let record = UsageRecord {
            id: Uuid::new_v4(),
            provider: response.provider.clone(),
            model: response.model.clone(),
            tokens: response.tokens_used,
            cost: response.cost,
            success: true,
            error: None,
            response_time_ms,
            timestamp: Utc::now(),
            user_id: user_id.map(String::from),
        };

        if let Err(e) = self.store.append(record).await {
            warn!(provider = %response.provider, error = %e, "Failed to persist usage record");
        }

        let mut totals = self.totals.write().await;
        let entry = totals.entry(response.provider.clone()).or_default();
        entry.requests += 1;
        entry.tokens += response.tokens_used;
        entry.cost += response.cost;
    }

    /// Record a failed attempt: zero cost, error text, request and failure
    /// counters bumped. No-op for the offline provider.
    pub async fn track_error(
        &self,
        provider: &str,
        model: &str,
        error_message: &str,
        user_id: Option<&str>,
        response_time_ms: u64,
    ) {
        if provider == OFFLINE_PROVIDER {
            debug!("Skipping error tracking for offline provider");
            return;
        }

        let record = UsageRecord {
            id: Uuid::new_v4(),
            provider: provider.to_string(),
            model: model.to_string(),
            tokens: 0,
            cost: 0.0,
            success: false,
            error: Some(error_message.to_string()),
            response_time_ms,
            timestamp: Utc::now(),
            user_id: user_id.map(String::from),
        };

        if let Err(e) = self.store.append(record).await {
            warn!(provider = %provider, error = %e, "Failed to persist failure record");
        }

        let mut totals = self.totals.write().await;
        let entry = totals.entry(provider.to_string()).or_default();
        entry.requests += 1;
        entry.failures += 1;
    }

    /// Aggregate a user's successful records. Any store failure degrades
    /// to the zeroed summary so reporting never breaks the caller.
    pub async fn get_user_cost_summary(
        &self,
        user_id: &str,
        provider: Option<&str>,
    ) -> CostSummary {
        let records = match self.store.records_for_user(user_id, provider).await {
            Ok(records) => records,
            Err(e) => {
                warn!(user = %user_id, error = %e, "Cost summary aggregation failed, returning zeroed summary");
                return CostSummary::default();
            }
        };

        let successes: Vec<&UsageRecord> = records.iter().filter(|r| r.success).collect();
        if successes.is_empty() {
            return CostSummary::default();
        }

        let total_requests = successes.len() as u64;
        let total_response_ms: u64 = successes.iter().map(|r| r.response_time_ms).sum();
        CostSummary {
            total_cost: successes.iter().map(|r| r.cost).sum(),
            total_tokens: successes.iter().map(|r| r.tokens).sum(),
            total_requests,
            avg_response_time_secs: total_response_ms as f64 / total_requests as f64 / 1000.0,
        }
    }

    pub async fn provider_totals(&self, provider: &str) -> Option<ProviderTotals> {
        self.totals.read().await.get(provider).copied()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(provider: &str, tokens: u64, cost: f64, latency_ms: u64) -> CompletionResponse {
        let mut metadata = HashMap::new();
        metadata.insert("latency_ms".to_string(), json!(latency_ms));
        CompletionResponse {
            text: "ok".into(),
            model: "test-model".into(),
            provider: provider.into(),
            tokens_used: tokens,
            cost,
            finish_reason: "stop".into(),
            metadata,
        }
    }

    #[tokio::test]
    async fn completion_writes_record_and_totals() {
        let store = Arc::new(InMemoryUsageStore::new());
        let tracker = UsageTracker::new(store.clone());

        tracker
            .track_completion(&response("openai", 30, 0.002, 450), Some("u1"))
            .await;

        let records = store.all_records().await;
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        assert_eq!(records[0].tokens, 30);
        assert_eq!(records[0].response_time_ms, 450);
        assert_eq!(records[0].user_id.as_deref(), Some("u1"));

        let totals = tracker.provider_totals("openai").await.unwrap();
        assert_eq!(totals.requests, 1);
        assert_eq!(totals.tokens, 30);
        assert!((totals.cost - 0.002).abs() < 1e-12);
        assert_eq!(totals.failures, 0);
    }

    #[tokio::test]
    async fn error_writes_zero_cost_failed_record() {
        let store = Arc::new(InMemoryUsageStore::new());
        let tracker = UsageTracker::new(store.clone());

        tracker
            .track_error("anthropic", "claude-haiku-4-5", "HTTP 529", Some("u1"), 120)
            .await;

        let records = store.all_records().await;
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert_eq!(records[0].cost, 0.0);
        assert_eq!(records[0].tokens, 0);
        assert_eq!(records[0].error.as_deref(), Some("HTTP 529"));

        let totals = tracker.provider_totals("anthropic").await.unwrap();
        assert_eq!(totals.requests, 1);
        assert_eq!(totals.failures, 1);
    }

    #[tokio::test]
    async fn offline_provider_is_a_no_op() {
        let store = Arc::new(InMemoryUsageStore::new());
        let tracker = UsageTracker::new(store.clone());

        tracker
            .track_completion(&response(OFFLINE_PROVIDER, 10, 0.0, 0), None)
            .await;
        tracker
            .track_error(OFFLINE_PROVIDER, "offline-echo", "nope", None, 0)
            .await;

        assert!(store.all_records().await.is_empty());
        assert!(tracker.provider_totals(OFFLINE_PROVIDER).await.is_none());
    }

    #[tokio::test]
    async fn cost_summary_aggregates_successes_only() {
        let tracker = UsageTracker::in_memory();
        tracker
            .track_completion(&response("openai", 100, 0.01, 1000), Some("u1"))
            .await;
        tracker
            .track_completion(&response("openai", 200, 0.02, 3000), Some("u1"))
            .await;
        tracker
            .track_error("openai", "gpt-4o-mini", "boom", Some("u1"), 50)
            .await;
        // Another user's traffic stays out of u1's summary.
        tracker
            .track_completion(&response("openai", 999, 9.9, 1), Some("u2"))
            .await;

        let summary = tracker.get_user_cost_summary("u1", None).await;
        assert_eq!(summary.total_requests, 2);
        assert_eq!(summary.total_tokens, 300);
        assert!((summary.total_cost - 0.03).abs() < 1e-12);
        assert!((summary.avg_response_time_secs - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn cost_summary_provider_filter() {
        let tracker = UsageTracker::in_memory();
        tracker
            .track_completion(&response("openai", 100, 0.01, 100), Some("u1"))
            .await;
        tracker
            .track_completion(&response("gemini", 50, 0.005, 100), Some("u1"))
            .await;

        let openai_only = tracker.get_user_cost_summary("u1", Some("openai")).await;
        assert_eq!(openai_only.total_requests, 1);
        assert_eq!(openai_only.total_tokens, 100);
    }

    struct FailingStore;

    #[async_trait]
    impl UsageStore for FailingStore {
        async fn append(&self, _record: UsageRecord) -> conduit_types::Result<()> {
            Err(conduit_types::ConduitError::Other("db down".into()))
        }
        async fn records_for_user(
            &self,
            _user_id: &str,
            _provider: Option<&str>,
        ) -> conduit_types::Result<Vec<UsageRecord>> {
            Err(conduit_types::ConduitError::Other("db down".into()))
        }
    }

    #[tokio::test]
    async fn broken_store_degrades_to_zeroed_summary() {
        let tracker = UsageTracker::new(Arc::new(FailingStore));
        // Neither call may panic or propagate.
        tracker
            .track_completion(&response("openai", 10, 0.001, 10), Some("u1"))
            .await;
        let summary = tracker.get_user_cost_summary("u1", None).await;
        assert_eq!(summary, CostSummary::default());
        // Totals still accumulate in memory even when persistence fails.
        assert!(tracker.provider_totals("openai").await.is_some());
    }

    #[tokio::test]
    async fn summary_for_unknown_user_is_zeroed() {
        let tracker = UsageTracker::in_memory();
        let summary = tracker.get_user_cost_summary("ghost", None).await;
        assert_eq!(summary, CostSummary::default());
    }
}
