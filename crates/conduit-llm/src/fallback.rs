//! Fallback orchestration across providers.
//!
//! Providers are tried strictly in order, never concurrently, so cost is
//! not incurred on providers that would have been skipped had an earlier
//! one succeeded.

use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use conduit_types::ConduitError;

use crate::ratelimit::RateLimiter;
use crate::registry::AdapterRegistry;
use crate::usage::UsageTracker;
use crate::{AttemptOutcome, AttemptRecord, CompletionRequest, CompletionResponse};

// ---------------------------------------------------------------------------
// FallbackOrchestrator
// ---------------------------------------------------------------------------

pub struct FallbackOrchestrator {
    registry: Arc<AdapterRegistry>,
    rate_limiter: Arc<RateLimiter>,
    tracker: Arc<UsageTracker>,
    preference: Vec<String>,
}

impl FallbackOrchestrator {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        rate_limiter: Arc<RateLimiter>,
        tracker: Arc<UsageTracker>,
        preference: Vec<String>,
    ) -> Self {
        Self {
            registry,
            rate_limiter,
            tracker,
            preference,
        }
    }

    pub fn preference(&self) -> &[String] {
        &self.preference
    }

    /// The configured order, with `preferred` moved (or inserted) first.
    fn attempt_order(&self, preferred: Option<&str>) -> Vec<String> {
        let mut order = self.preference.clone();
        if let Some(name) = preferred {
            if let Some(pos) = order.iter().position(|n| n == name) {
                let entry = order.remove(pos);
                order.insert(0, entry);
            } else {
                order.insert(0, name.to_string());
            }
        }
        order
    }

    /// Drive the attempt sequence. Returns the first success, annotated
    /// with the full attempt trail; fails with `PlatformUnavailable` only
    /// when every provider in the list has been exhausted.
    pub async fn generate(
        &self,
        request: &CompletionRequest,
        preferred: Option<&str>,
    ) -> conduit_types::Result<CompletionResponse> {
        let order = self.attempt_order(preferred);
        let user_id = request.user_id.as_deref();
        let mut trail: Vec<AttemptRecord> = Vec::new();
        let mut last_error: Option<String> = None;

        for name in &order {
            let Some(adapter) = self.registry.get_adapter(name).await else {
                debug!(provider = %name, "Provider not registered, skipping");
                trail.push(AttemptRecord {
                    provider: name.clone(),
                    outcome: AttemptOutcome::Skipped {
                        reason: "provider not registered".into(),
                    },
                });
                continue;
            };

            // Admission control before the adapter is invoked; providers
            // without a config (offline, manual inserts) are unmetered.
            if let Some(config) = self.registry.provider_config(name).await {
                let decision = self.rate_limiter.check_platform_limit(&config, user_id).await;
                if !decision.allowed {
                    let message = format!(
                        "rate limit of {} requests per minute exceeded",
                        config.requests_per_minute
                    );
                    warn!(provider = %name, "Rate limit denied attempt, trying next provider");
                    trail.push(AttemptRecord {
                        provider: name.clone(),
                        outcome: AttemptOutcome::Failed {
                            error: message.clone(),
                        },
                    });
                    self.tracker
                        .track_error(name, &config.default_model, &message, user_id, 0)
                        .await;
                    last_error = Some(message);
                    continue;
                }
            }

            let started = Instant::now();
            match adapter.generate(request, None).await {
                Ok(mut response) => {
                    trail.push(AttemptRecord {
                        provider: name.clone(),
                        outcome: AttemptOutcome::Succeeded {
                            tokens: response.tokens_used,
                            cost: response.cost,
                        },
                    });
                    self.tracker.track_completion(&response, user_id).await;

                    response
                        .metadata
                        .insert("attempts".to_string(), serde_json::to_value(&trail)?);
                    if let Some(requested) =
                        preferred.map(String::from).or_else(|| order.first().cloned())
                    {
                        response
                            .metadata
                            .insert("requested_provider".to_string(), json!(requested));
                    }
                    return Ok(response);
                }
                Err(e) => {
                    let message = e.to_string();
                    let latency_ms = started.elapsed().as_millis() as u64;
                    warn!(provider = %name, error = %message, "Provider attempt failed, trying next");
                    trail.push(AttemptRecord {
                        provider: name.clone(),
                        outcome: AttemptOutcome::Failed {
                            error: message.clone(),
                        },
                    });
                    self.tracker
                        .track_error(name, adapter.default_model(), &message, user_id, latency_ms)
                        .await;
                    last_error = Some(message);
                }
            }
        }

        Err(ConduitError::PlatformUnavailable {
            attempts: trail.len(),
            last_error: last_error.unwrap_or_else(|| "no providers attempted".into()),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticConfigStore;
    use crate::provider::{DynProvider, ProviderAdapter};
    use crate::{CompletionStream, HealthReport};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedProvider {
        name: String,
        fail: bool,
        calls: Arc<AtomicUsize>,
        call_log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedProvider {
        async fn generate(
            &self,
            _request: &CompletionRequest,
            _model_override: Option<&str>,
        ) -> conduit_types::Result<CompletionResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.call_log.lock().unwrap().push(self.name.clone());
            if self.fail {
                return Err(ConduitError::ProviderError {
                    provider: self.name.clone(),
                    status: 503,
                    message: format!("{} is down", self.name),
                    retryable: false,
                });
            }
            let mut metadata = HashMap::new();
            metadata.insert("latency_ms".to_string(), json!(5));
            Ok(CompletionResponse {
                text: format!("reply from {}", self.name),
                model: "scripted-model".into(),
                provider: self.name.clone(),
                tokens_used: 12,
                cost: 0.0004,
                finish_reason: "stop".into(),
                metadata,
            })
        }

        async fn generate_streaming(
            &self,
            _request: &CompletionRequest,
            _model_override: Option<&str>,
        ) -> conduit_types::Result<CompletionStream> {
            Ok(Box::pin(tokio_stream::empty()))
        }

        fn calculate_cost(&self, _model: &str, _input: u64, _output: u64) -> f64 {
            0.0
        }

        async fn check_health(&self) -> HealthReport {
            HealthReport::healthy(1)
        }

        fn validate_request(
            &self,
            _request: &CompletionRequest,
            _model: &str,
        ) -> conduit_types::Result<()> {
            Ok(())
        }

        fn available_models(&self) -> Vec<String> {
            vec!["scripted-model".into()]
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn default_model(&self) -> &str {
            "scripted-model"
        }
    }

    struct Harness {
        registry: Arc<AdapterRegistry>,
        orchestrator: FallbackOrchestrator,
        call_log: Arc<Mutex<Vec<String>>>,
        counters: HashMap<String, Arc<AtomicUsize>>,
    }

    impl Harness {
        async fn new(providers: &[(&str, bool)]) -> Self {
            let registry = Arc::new(AdapterRegistry::new(
                Arc::new(StaticConfigStore::new(vec![])),
                "secret",
            ));
            registry.initialize().await.unwrap();

            let call_log = Arc::new(Mutex::new(Vec::new()));
            let mut counters = HashMap::new();
            let mut preference = Vec::new();

            for (name, fail) in providers {
                let calls = Arc::new(AtomicUsize::new(0));
                counters.insert(name.to_string(), calls.clone());
                preference.push(name.to_string());
                registry
                    .insert_adapter(
                        *name,
                        DynProvider::new(ScriptedProvider {
                            name: name.to_string(),
                            fail: *fail,
                            calls,
                            call_log: call_log.clone(),
                        }),
                    )
                    .await;
            }

            let orchestrator = FallbackOrchestrator::new(
                registry.clone(),
                Arc::new(RateLimiter::in_memory()),
                Arc::new(UsageTracker::in_memory()),
                preference,
            );

            Self {
                registry,
                orchestrator,
                call_log,
                counters,
            }
        }
    }

    #[tokio::test]
    async fn providers_tried_in_order_until_success() {
        let harness = Harness::new(&[("alpha", true), ("beta", true), ("gamma", false)]).await;
        let request = CompletionRequest::from_prompt("hello");

        let response = harness.orchestrator.generate(&request, None).await.unwrap();
        assert_eq!(response.provider, "gamma");
        assert_eq!(response.text, "reply from gamma");

        assert_eq!(
            *harness.call_log.lock().unwrap(),
            vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()]
        );

        let attempts = response.metadata["attempts"].as_array().unwrap();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[0]["provider"], "alpha");
        assert_eq!(attempts[0]["outcome"], "failed");
        assert_eq!(attempts[1]["provider"], "beta");
        assert_eq!(attempts[1]["outcome"], "failed");
        assert_eq!(attempts[2]["provider"], "gamma");
        assert_eq!(attempts[2]["outcome"], "succeeded");
        assert_eq!(attempts[2]["tokens"], 12);
    }

    #[tokio::test]
    async fn no_provider_invoked_after_first_success() {
        let harness = Harness::new(&[("alpha", false), ("beta", false)]).await;
        let request = CompletionRequest::from_prompt("hello");

        let response = harness.orchestrator.generate(&request, None).await.unwrap();
        assert_eq!(response.provider, "alpha");
        assert_eq!(harness.counters["alpha"].load(Ordering::SeqCst), 1);
        assert_eq!(harness.counters["beta"].load(Ordering::SeqCst), 0);

        let attempts = response.metadata["attempts"].as_array().unwrap();
        assert_eq!(attempts.len(), 1);
    }

    #[tokio::test]
    async fn exhaustion_yields_platform_unavailable() {
        let harness = Harness::new(&[("alpha", true), ("beta", true), ("gamma", true)]).await;
        let request = CompletionRequest::from_prompt("hello");

        let err = harness
            .orchestrator
            .generate(&request, None)
            .await
            .unwrap_err();
        match err {
            ConduitError::PlatformUnavailable {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("gamma is down"));
            }
            other => panic!("expected PlatformUnavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unregistered_provider_recorded_as_skipped() {
        let harness = Harness::new(&[("alpha", true), ("gamma", false)]).await;
        let orchestrator = FallbackOrchestrator::new(
            harness.registry.clone(),
            Arc::new(RateLimiter::in_memory()),
            Arc::new(UsageTracker::in_memory()),
            vec!["ghost".into(), "alpha".into(), "gamma".into()],
        );

        let request = CompletionRequest::from_prompt("hello");
        let response = orchestrator.generate(&request, None).await.unwrap();

        let attempts = response.metadata["attempts"].as_array().unwrap();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[0]["provider"], "ghost");
        assert_eq!(attempts[0]["outcome"], "skipped");
        assert_eq!(attempts[1]["outcome"], "failed");
        assert_eq!(attempts[2]["outcome"], "succeeded");
    }

    #[tokio::test]
    async fn preferred_provider_moves_to_front() {
        let harness = Harness::new(&[("alpha", false), ("beta", false)]).await;
        let request = CompletionRequest::from_prompt("hello");

        let response = harness
            .orchestrator
            .generate(&request, Some("beta"))
            .await
            .unwrap();
        assert_eq!(response.provider, "beta");
        assert_eq!(response.metadata["requested_provider"], "beta");
        assert_eq!(harness.counters["alpha"].load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn every_attempt_is_tracked() {
        let store = Arc::new(crate::usage::InMemoryUsageStore::new());
        let registry = Arc::new(AdapterRegistry::new(
            Arc::new(StaticConfigStore::new(vec![])),
            "secret",
        ));
        registry.initialize().await.unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        for (name, fail) in [("alpha", true), ("beta", false)] {
            registry
                .insert_adapter(
                    name,
                    DynProvider::new(ScriptedProvider {
                        name: name.into(),
                        fail,
                        calls: Arc::new(AtomicUsize::new(0)),
                        call_log: log.clone(),
                    }),
                )
                .await;
        }

        let orchestrator = FallbackOrchestrator::new(
            registry,
            Arc::new(RateLimiter::in_memory()),
            Arc::new(UsageTracker::new(store.clone())),
            vec!["alpha".into(), "beta".into()],
        );

        let mut request = CompletionRequest::from_prompt("hello");
        request.user_id = Some("u1".into());
        orchestrator.generate(&request, None).await.unwrap();

        let records = store.all_records().await;
        assert_eq!(records.len(), 2);
        assert!(!records[0].success);
        assert_eq!(records[0].provider, "alpha");
        assert!(records[1].success);
        assert_eq!(records[1].provider, "beta");
        assert_eq!(records[1].user_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn rate_limited_provider_fails_over() {
        // Real config so the registry meters the provider; the adapter is
        // replaced with a scripted one that would succeed if reached.
        let mut throttled = crate::config::ProviderConfig::new("openai", "gpt-4o-mini");
        throttled.credential = "sk-test".into();
        throttled.requests_per_minute = 0;

        let registry = Arc::new(AdapterRegistry::new(
            Arc::new(StaticConfigStore::new(vec![throttled])),
            "secret",
        ));
        registry.initialize().await.unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let openai_calls = Arc::new(AtomicUsize::new(0));
        registry
            .insert_adapter(
                "openai",
                DynProvider::new(ScriptedProvider {
                    name: "openai".into(),
                    fail: false,
                    calls: openai_calls.clone(),
                    call_log: log.clone(),
                }),
            )
            .await;
        registry
            .insert_adapter(
                "backup",
                DynProvider::new(ScriptedProvider {
                    name: "backup".into(),
                    fail: false,
                    calls: Arc::new(AtomicUsize::new(0)),
                    call_log: log.clone(),
                }),
            )
            .await;

        let orchestrator = FallbackOrchestrator::new(
            registry,
            Arc::new(RateLimiter::in_memory()),
            Arc::new(UsageTracker::in_memory()),
            vec!["openai".into(), "backup".into()],
        );

        let request = CompletionRequest::from_prompt("hello");
        let response = orchestrator.generate(&request, None).await.unwrap();

        // The throttled provider was never invoked.
        assert_eq!(openai_calls.load(Ordering::SeqCst), 0);
        assert_eq!(response.provider, "backup");

        let attempts = response.metadata["attempts"].as_array().unwrap();
        assert_eq!(attempts[0]["outcome"], "failed");
        assert!(attempts[0]["error"]
            .as_str()
            .unwrap()
            .contains("rate limit"));
    }
}
