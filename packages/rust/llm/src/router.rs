//! Provider Router: task name to ordered provider candidates.
//!
//! `dispatch` checks the ledger before any network call, retries transient
//! failures on the same provider, then fails over to the next candidate.
//! Every successful dispatch appends exactly one ledger entry sized by the
//! usage the provider reported.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use compintel_shared::{AppConfig, CompIntelError, Result, RetryPolicy};

use crate::ledger::{BudgetWarning, CostLedger};
use crate::provider::{Completion, LlmProvider, LlmRequest};
use crate::providers::build_provider;

/// Result of a successful dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    pub content: String,
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    /// Sequence number of the ledger entry this call produced.
    pub ledger_seq: u64,
    /// Set when spend has crossed a soft threshold.
    pub budget_warning: Option<BudgetWarning>,
}

impl LlmResponse {
    /// Parse the content as JSON, tolerating a surrounding code fence.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(strip_code_fences(&self.content)).map_err(|e| {
            CompIntelError::parse(format!("{} returned invalid JSON: {e}", self.provider))
        })
    }
}

/// Remove a leading ```` ```json ```` / ```` ``` ```` fence and its closer.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

pub struct Router {
    routes: HashMap<String, Vec<Arc<dyn LlmProvider>>>,
    ledger: Arc<CostLedger>,
    retry: RetryPolicy,
}

impl Router {
    pub fn new(ledger: Arc<CostLedger>, retry: RetryPolicy) -> Self {
        Self {
            routes: HashMap::new(),
            ledger,
            retry,
        }
    }

    /// Register `providers` (primary first) for `task`.
    pub fn with_route(mut self, task: impl Into<String>, providers: Vec<Arc<dyn LlmProvider>>) -> Self {
        self.routes.insert(task.into(), providers);
        self
    }

    /// Build every configured route. Candidates whose API key is unset are
    /// skipped with a warning; a task left with no candidates stays routable
    /// and fails with `ProviderExhausted`.
    pub fn from_config(config: &AppConfig, ledger: Arc<CostLedger>) -> Self {
        let mut router = Self::new(ledger, RetryPolicy::from(&config.retry));
        for (task, routing) in &config.routing {
            let mut providers = Vec::new();
            for candidate in &routing.candidates {
                match build_provider(candidate) {
                    Ok(provider) => providers.push(provider),
                    Err(e) => warn!(
                        task = task.as_str(),
                        provider = candidate.provider.as_str(),
                        model = candidate.model.as_str(),
                        error = %e,
                        "skipping provider candidate"
                    ),
                }
            }
            router.routes.insert(task.clone(), providers);
        }
        router
    }

    pub fn ledger(&self) -> &Arc<CostLedger> {
        &self.ledger
    }

    pub fn has_task(&self, task: &str) -> bool {
        self.routes.contains_key(task)
    }

    /// Usable candidates for `task`, primary first.
    pub fn candidates(&self, task: &str) -> &[Arc<dyn LlmProvider>] {
        self.routes.get(task).map(Vec::as_slice).unwrap_or_default()
    }

    #[instrument(skip_all, fields(task = %task, kind = request.kind()))]
    pub async fn dispatch(&self, task: &str, request: &LlmRequest) -> Result<LlmResponse> {
        let candidates = self
            .routes
            .get(task)
            .ok_or_else(|| CompIntelError::config(format!("no route configured for task '{task}'")))?;

        if let Some(w) = self.ledger.ensure_can_dispatch().await? {
            warn!(
                threshold_pct = w.threshold_pct,
                spent_usd = w.spent_usd,
                "dispatching past soft budget threshold"
            );
        }

        let mut attempts = Vec::new();
        for provider in candidates {
            let result = self
                .retry
                .run(task, |attempt| self.attempt(provider.as_ref(), request, attempt))
                .await;

            match result {
                Ok(completion) => return Ok(self.settle(task, provider.as_ref(), completion).await),
                Err(e) if e.is_budget() => return Err(e),
                Err(e) => {
                    warn!(
                        provider = provider.name(),
                        model = provider.model(),
                        error = %e,
                        "provider failed; failing over"
                    );
                    attempts.push(format!("{}/{}: {e}", provider.name(), provider.model()));
                }
            }
        }

        if attempts.is_empty() {
            attempts.push("no usable provider candidates".to_string());
        }
        Err(CompIntelError::ProviderExhausted {
            task: task.to_string(),
            attempts,
        })
    }

    /// One provider call, refused if the ceiling was reached meanwhile and
    /// cancelled if it is reached while the call is in flight.
    async fn attempt(
        &self,
        provider: &dyn LlmProvider,
        request: &LlmRequest,
        attempt: u32,
    ) -> Result<Completion> {
        self.ledger.ensure_can_dispatch().await?;
        debug!(provider = provider.name(), model = provider.model(), attempt, "dispatching");

        tokio::select! {
            biased;
            Some(spent_usd) = self.ledger.wait_for_halt() => Err(CompIntelError::BudgetExceeded {
                spent_usd,
                ceiling_usd: self.ledger.limits().ceiling_usd(),
            }),
            result = provider.dispatch(request) => result,
        }
    }

    async fn settle(&self, task: &str, provider: &dyn LlmProvider, completion: Completion) -> LlmResponse {
        let cost_usd = provider
            .pricing()
            .cost(completion.input_tokens, completion.output_tokens);
        let entry = self
            .ledger
            .record(
                task,
                provider.name(),
                provider.model(),
                completion.input_tokens,
                completion.output_tokens,
                cost_usd,
            )
            .await;

        LlmResponse {
            content: completion.content,
            provider: provider.name().to_string(),
            model: provider.model().to_string(),
            input_tokens: completion.input_tokens,
            output_tokens: completion.output_tokens,
            cost_usd,
            ledger_seq: entry.seq,
            budget_warning: self.ledger.warning().await,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{ScriptedProvider, ok};
    use super::*;
    use crate::ledger::BudgetLimits;
    use crate::provider::Prompt;

    fn ledger(max_usd: f64) -> Arc<CostLedger> {
        Arc::new(CostLedger::new(BudgetLimits {
            max_usd,
            alert_at_pct: vec![50, 75],
            hard_stop_pct: 100,
        }))
    }

    fn request() -> LlmRequest {
        LlmRequest::Text(Prompt::new("hello"))
    }

    fn rate_limited() -> Result<Completion> {
        Err(CompIntelError::RateLimited {
            service: "primary".into(),
            retry_after_secs: None,
        })
    }

    #[tokio::test]
    async fn success_appends_one_entry_from_reported_usage() {
        let primary = ScriptedProvider::new("primary", vec![ok("hi", 1_000, 500)]);
        let ledger = ledger(10.0);
        let router = Router::new(Arc::clone(&ledger), RetryPolicy::immediate(3))
            .with_route("extract", vec![primary.handle()]);

        let response = router.dispatch("extract", &request()).await.expect("dispatch");
        assert_eq!(response.content, "hi");
        assert_eq!(response.provider, "primary");
        assert!((response.cost_usd - 0.0015).abs() < 1e-12);

        let entries = ledger.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].input_tokens, 1_000);
        assert_eq!(entries[0].task, "extract");
        assert_eq!(response.ledger_seq, 1);
    }

    #[tokio::test]
    async fn transient_errors_retry_then_fail_over() {
        let primary =
            ScriptedProvider::new("primary", vec![rate_limited(), rate_limited(), rate_limited()]);
        let secondary = ScriptedProvider::new("secondary", vec![ok("fallback", 10, 10)]);
        let ledger = ledger(10.0);
        let router = Router::new(Arc::clone(&ledger), RetryPolicy::immediate(3))
            .with_route("extract", vec![primary.handle(), secondary.handle()]);

        let response = router.dispatch("extract", &request()).await.expect("dispatch");
        assert_eq!(response.provider, "secondary");
        assert_eq!(primary.calls(), 3);
        assert_eq!(secondary.calls(), 1);
        assert_eq!(ledger.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn transient_then_success_stays_on_primary() {
        let primary = ScriptedProvider::new("primary", vec![rate_limited(), ok("second try", 1, 1)]);
        let secondary = ScriptedProvider::new("secondary", vec![]);
        let router = Router::new(ledger(10.0), RetryPolicy::immediate(3))
            .with_route("extract", vec![primary.handle(), secondary.handle()]);

        let response = router.dispatch("extract", &request()).await.expect("dispatch");
        assert_eq!(response.provider, "primary");
        assert_eq!(secondary.calls(), 0);
    }

    #[tokio::test]
    async fn all_candidates_failing_is_provider_exhausted() {
        let primary = ScriptedProvider::new("primary", vec![]);
        let secondary = ScriptedProvider::new("secondary", vec![]);
        let ledger = ledger(10.0);
        let router = Router::new(Arc::clone(&ledger), RetryPolicy::immediate(2))
            .with_route("extract", vec![primary.handle(), secondary.handle()]);

        let err = router.dispatch("extract", &request()).await.expect_err("exhausted");
        match err {
            CompIntelError::ProviderExhausted { task, attempts } => {
                assert_eq!(task, "extract");
                assert_eq!(attempts.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(ledger.entries().await.is_empty());
    }

    #[tokio::test]
    async fn budget_at_ceiling_refuses_before_any_call() {
        let primary = ScriptedProvider::new("primary", vec![ok("never", 1, 1)]);
        let ledger = ledger(1.0);
        ledger.record("earlier", "primary", "scripted", 0, 0, 1.0).await;
        let router = Router::new(Arc::clone(&ledger), RetryPolicy::immediate(3))
            .with_route("extract", vec![primary.handle()]);

        let err = router.dispatch("extract", &request()).await.expect_err("refused");
        assert!(err.is_budget());
        assert_eq!(primary.calls(), 0);
        assert_eq!(ledger.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn soft_threshold_warns_then_ceiling_blocks() {
        // 600k tokens at $1/M = $0.60 against a $1 budget.
        let primary = ScriptedProvider::new(
            "primary",
            vec![ok("a", 300_000, 300_000), ok("b", 200_000, 200_000), ok("c", 1, 1)],
        );
        let ledger = ledger(1.0);
        let router = Router::new(Arc::clone(&ledger), RetryPolicy::immediate(1))
            .with_route("extract", vec![primary.handle()]);

        let first = router.dispatch("extract", &request()).await.expect("first");
        assert_eq!(first.budget_warning.map(|w| w.threshold_pct), Some(50));

        let second = router.dispatch("extract", &request()).await.expect("second");
        assert!(second.budget_warning.is_some());
        assert!(ledger.is_halted());

        let err = router.dispatch("extract", &request()).await.expect_err("blocked");
        assert!(err.is_budget());
        assert_eq!(primary.calls(), 2);
    }

    #[tokio::test]
    async fn unknown_task_is_config_error() {
        let router = Router::new(ledger(1.0), RetryPolicy::none());
        let err = router.dispatch("missing", &request()).await.expect_err("no route");
        assert!(err.to_string().contains("missing"));
    }

    #[tokio::test]
    async fn empty_route_is_exhausted() {
        let router = Router::new(ledger(1.0), RetryPolicy::none()).with_route("extract", vec![]);
        let err = router.dispatch("extract", &request()).await.expect_err("empty");
        assert!(matches!(err, CompIntelError::ProviderExhausted { .. }));
    }

    #[test]
    fn code_fences_are_stripped() {
        assert_eq!(strip_code_fences("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fences("```\n[]\n```\n"), "[]");
        assert_eq!(strip_code_fences("  {\"a\": 1} "), "{\"a\": 1}");
    }

    #[test]
    fn response_json_parses_fenced_content() {
        let response = LlmResponse {
            content: "```json\n{\"claims\": []}\n```".into(),
            provider: "claude".into(),
            model: "m".into(),
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            ledger_seq: 1,
            budget_warning: None,
        };
        let value: serde_json::Value = response.json().expect("json");
        assert_eq!(value["claims"], serde_json::json!([]));
    }
}
