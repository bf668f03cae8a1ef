//! Synchronous invocation pipeline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use aip_primitives::{
    CapabilityCard, ErrorEnvelope, ErrorKind, InvocationRequest, InvocationResult, Usage,
};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::budget::BudgetLedger;
use crate::cancel::cancel_pair;
use crate::registry::HandlerRegistry;
use crate::traits::{
    AuditEvent, AuditOutcome, AuditSink, CostEstimator, HandlerError, IdempotencyStore,
};

/// Validates and dispatches single request/response calls.
///
/// All protocol failures resolve locally into a typed error envelope; the
/// router itself never errors at the transport level.
pub struct InvocationRouter {
    card: Arc<CapabilityCard>,
    registry: Arc<HandlerRegistry>,
    estimator: Arc<dyn CostEstimator>,
    audit: Arc<dyn AuditSink>,
    idempotency: Option<Arc<dyn IdempotencyStore>>,
}

impl InvocationRouter {
    /// Creates a router over the loaded card and its collaborators.
    #[must_use]
    pub fn new(
        card: Arc<CapabilityCard>,
        registry: Arc<HandlerRegistry>,
        estimator: Arc<dyn CostEstimator>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            card,
            registry,
            estimator,
            audit,
            idempotency: None,
        }
    }

    /// Installs the replay-safety collaborator.
    #[must_use]
    pub fn with_idempotency(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.idempotency = Some(store);
        self
    }

    /// Returns the capability card this router serves.
    #[must_use]
    pub fn card(&self) -> &Arc<CapabilityCard> {
        &self.card
    }

    /// Executes one synchronous invocation.
    ///
    /// Pipeline: request validation → capability check → param check →
    /// replay check → budget check against the estimator's minimum (the
    /// handler is never invoked on budget rejection) → dispatch under the
    /// card's latency deadline with a request-scoped cancellation signal.
    pub async fn invoke(&self, request: &InvocationRequest) -> InvocationResult {
        let method = request.method().to_owned();
        let correlation_id = request.correlation_id().clone();

        if let Err(err) = request.validate() {
            return self.reject(
                &method,
                &correlation_id,
                ErrorEnvelope::new(ErrorKind::ValidationError, err.to_string()),
            );
        }

        // Capability check comes before any estimator consultation.
        if !self.card.supports(&method) {
            return self.reject(
                &method,
                &correlation_id,
                ErrorEnvelope::new(
                    ErrorKind::ValidationError,
                    format!("method `{method}` is not advertised by this agent"),
                ),
            );
        }

        let Some(handler) = self.registry.get(&method) else {
            // Advertised but not mounted: a server misconfiguration, not
            // something the caller can fix.
            warn!(method, "capability advertised without a mounted handler");
            return self.reject(
                &method,
                &correlation_id,
                ErrorEnvelope::new(ErrorKind::AgentUnavailable, "capability is not mounted"),
            );
        };
        let handler = Arc::clone(handler);

        if let Err(err) = handler.validate_params(request.params()) {
            return self.reject(
                &method,
                &correlation_id,
                classify_handler_error(&method, &err),
            );
        }

        if let Some(store) = &self.idempotency {
            if store.seen(&correlation_id).await {
                if let Some(result) = store.replay(&correlation_id).await {
                    info!(%correlation_id, method, "replayed recorded result");
                    return result;
                }
            }
        }

        let minimum = self.estimator.estimate(&method, request.params());
        let mut ledger = BudgetLedger::new(request.budget_usd());
        if !ledger.covers(minimum) {
            debug!(
                method,
                budget = ledger.budget_usd(),
                minimum,
                "rejecting before dispatch: budget below estimate"
            );
            return self.reject(
                &method,
                &correlation_id,
                ErrorEnvelope::new(
                    ErrorKind::BudgetExceeded,
                    format!(
                        "declared budget {:.6} USD is below the {minimum:.6} USD minimum for `{method}`",
                        ledger.budget_usd()
                    ),
                ),
            );
        }

        let (cancel_handle, cancel_signal) = cancel_pair();
        let deadline = Duration::from_millis(self.card.limits().max_latency_ms());
        let started = Instant::now();

        let outcome = timeout(
            deadline,
            handler.handle(request.params().clone(), cancel_signal),
        )
        .await;
        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Err(_) => {
                cancel_handle.cancel();
                InvocationResult::failure(ErrorEnvelope::new(
                    ErrorKind::Timeout,
                    format!("call exceeded the {}ms latency limit", deadline.as_millis()),
                ))
            }
            Ok(Err(err)) => InvocationResult::failure(classify_handler_error(&method, &err)),
            Ok(Ok(output)) => {
                let usage = Usage::new(output.tokens_used, output.cost_usd, duration_ms);
                match ledger.commit(output.cost_usd) {
                    Ok(()) => InvocationResult::success(output.value, usage),
                    Err(breach) => {
                        warn!(method, %correlation_id, committed = breach.committed_usd,
                              "actual cost exceeded declared budget");
                        self.emit_audit(&method, &correlation_id, &breach.to_envelope(), Some(usage));
                        return InvocationResult::failure(breach.to_envelope());
                    }
                }
            }
        };

        match result.error() {
            None => {
                self.audit.record(AuditEvent::now(
                    &method,
                    correlation_id.clone(),
                    AuditOutcome::Completed,
                    result.usage().copied(),
                ));
                if let Some(store) = &self.idempotency {
                    store.record(&correlation_id, &result).await;
                }
            }
            Some(envelope) => {
                self.emit_audit(&method, &correlation_id, envelope, None);
            }
        }

        result
    }

    fn reject(
        &self,
        method: &str,
        correlation_id: &aip_primitives::CorrelationId,
        envelope: ErrorEnvelope,
    ) -> InvocationResult {
        self.emit_audit(method, correlation_id, &envelope, None);
        InvocationResult::failure(envelope)
    }

    fn emit_audit(
        &self,
        method: &str,
        correlation_id: &aip_primitives::CorrelationId,
        envelope: &ErrorEnvelope,
        usage: Option<Usage>,
    ) {
        self.audit.record(AuditEvent::now(
            method,
            correlation_id.clone(),
            AuditOutcome::Failed(envelope.reason().to_owned()),
            usage,
        ));
    }
}

/// Maps a handler failure onto the wire envelope, sanitizing internal detail.
pub(crate) fn classify_handler_error(method: &str, err: &HandlerError) -> ErrorEnvelope {
    match err {
        HandlerError::InvalidParams { reason } => ErrorEnvelope::new(
            ErrorKind::ValidationError,
            format!("invalid params for `{method}`: {reason}"),
        ),
        HandlerError::Timeout => {
            ErrorEnvelope::new(ErrorKind::Timeout, "handler deadline exceeded")
        }
        HandlerError::RateLimited => {
            ErrorEnvelope::new(ErrorKind::RateLimited, "agent is throttling requests")
        }
        HandlerError::Unavailable { .. } | HandlerError::Internal(_) => {
            // Log the detail server-side; the envelope stays generic.
            warn!(method, error = %err, "handler failure");
            ErrorEnvelope::new(ErrorKind::AgentUnavailable, "internal agent failure")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HandlerRegistry;
    use crate::traits::{
        BusinessHandler, CollectingAuditSink, CostEstimator, HandlerOutput, HandlerResult,
        StaticCostEstimator,
    };
    use aip_primitives::{AuthRequirement, CardLimits, CorrelationId};
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BusinessHandler for CountingHandler {
        fn validate_params(&self, params: &Value) -> HandlerResult<()> {
            if params.get("message").and_then(Value::as_str).is_none() {
                return Err(HandlerError::invalid_params("`message` string required"));
            }
            Ok(())
        }

        async fn handle(
            &self,
            _params: Value,
            _cancel: crate::CancelSignal,
        ) -> HandlerResult<HandlerOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerOutput::new(json!({"intent": "plan"}), 12, 0.002))
        }
    }

    struct CountingEstimator {
        estimates: Arc<AtomicUsize>,
        price: f64,
    }

    impl CostEstimator for CountingEstimator {
        fn estimate(&self, _method: &str, _params: &Value) -> f64 {
            self.estimates.fetch_add(1, Ordering::SeqCst);
            self.price
        }
    }

    fn card() -> Arc<CapabilityCard> {
        Arc::new(
            CapabilityCard::builder("planner")
                .version("1.0.0")
                .capability("classify_intent")
                .capability("ghost_method")
                .limits(CardLimits::new(8192, 2048, 5_000, 0.25))
                .auth(AuthRequirement {
                    method: "bearer".into(),
                    audience: "aip".into(),
                })
                .build()
                .unwrap(),
        )
    }

    struct Fixture {
        router: InvocationRouter,
        calls: Arc<AtomicUsize>,
        estimates: Arc<AtomicUsize>,
        audit: Arc<CollectingAuditSink>,
    }

    fn fixture() -> Fixture {
        let calls = Arc::new(AtomicUsize::new(0));
        let estimates = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry
            .register(
                "classify_intent",
                Arc::new(CountingHandler {
                    calls: Arc::clone(&calls),
                }),
            )
            .unwrap();
        let audit = CollectingAuditSink::new();
        let estimator = CountingEstimator {
            estimates: Arc::clone(&estimates),
            price: 0.002,
        };
        let router = InvocationRouter::new(
            card(),
            Arc::new(registry),
            Arc::new(estimator),
            audit.clone(),
        );
        Fixture {
            router,
            calls,
            estimates,
            audit,
        }
    }

    fn request(budget: f64) -> InvocationRequest {
        InvocationRequest::new(
            "classify_intent",
            json!({"message": "I want a plan"}),
            CorrelationId::new("req-1").unwrap(),
            budget,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn sufficient_budget_invokes_handler() {
        let fx = fixture();
        let result = fx.router.invoke(&request(0.05)).await;
        let (value, usage) = result.into_result().expect("value");
        assert_eq!(value["intent"], "plan");
        assert!((usage.cost_usd - 0.002).abs() < 1e-12);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.estimates.load(Ordering::SeqCst), 1);

        let events = fx.audit.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, AuditOutcome::Completed);
    }

    #[tokio::test]
    async fn budget_below_estimate_never_invokes_handler() {
        let fx = fixture();
        let result = fx.router.invoke(&request(0.0001)).await;
        let envelope = result.into_result().expect_err("rejected");
        assert_eq!(envelope.code(), -32001);
        assert_eq!(envelope.reason(), "BUDGET_EXCEEDED");
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unsupported_method_is_validation_error() {
        let fx = fixture();
        let request = InvocationRequest::new(
            "transcribe_audio",
            json!({}),
            CorrelationId::new("req-2").unwrap(),
            1.0,
        )
        .unwrap();
        let envelope = fx.router.invoke(&request).await.into_result().expect_err("rejected");
        assert_eq!(envelope.kind(), ErrorKind::ValidationError);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
        // Rejected before cost estimation ever runs.
        assert_eq!(fx.estimates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_params_are_validation_error() {
        let fx = fixture();
        let request = InvocationRequest::new(
            "classify_intent",
            json!({"wrong": true}),
            CorrelationId::new("req-3").unwrap(),
            1.0,
        )
        .unwrap();
        let envelope = fx.router.invoke(&request).await.into_result().expect_err("rejected");
        assert_eq!(envelope.kind(), ErrorKind::ValidationError);
        assert!(envelope.message().contains("message"));
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fx.estimates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn advertised_but_unmounted_method_is_unavailable() {
        let fx = fixture();
        let request = InvocationRequest::new(
            "ghost_method",
            json!({}),
            CorrelationId::new("req-4").unwrap(),
            1.0,
        )
        .unwrap();
        let envelope = fx.router.invoke(&request).await.into_result().expect_err("rejected");
        assert_eq!(envelope.kind(), ErrorKind::AgentUnavailable);
    }

    struct FailingHandler;

    #[async_trait]
    impl BusinessHandler for FailingHandler {
        async fn handle(
            &self,
            _params: Value,
            _cancel: crate::CancelSignal,
        ) -> HandlerResult<HandlerOutput> {
            Err(HandlerError::internal("database password is hunter2"))
        }
    }

    #[tokio::test]
    async fn internal_failures_never_leak_detail() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("classify_intent", Arc::new(FailingHandler))
            .unwrap();
        let router = InvocationRouter::new(
            card(),
            Arc::new(registry),
            Arc::new(StaticCostEstimator::new(0.001)),
            CollectingAuditSink::new(),
        );
        let envelope = router.invoke(&request(1.0)).await.into_result().expect_err("failure");
        assert_eq!(envelope.kind(), ErrorKind::AgentUnavailable);
        assert!(!envelope.message().contains("hunter2"));
    }

    struct SlowHandler;

    #[async_trait]
    impl BusinessHandler for SlowHandler {
        async fn handle(
            &self,
            _params: Value,
            cancel: crate::CancelSignal,
        ) -> HandlerResult<HandlerOutput> {
            cancel.cancelled().await;
            Err(HandlerError::Timeout)
        }
    }

    #[tokio::test]
    async fn deadline_overrun_is_timeout() {
        let card = Arc::new(
            CapabilityCard::builder("planner")
                .version("1.0.0")
                .capability("classify_intent")
                .limits(CardLimits::new(8192, 2048, 50, 0.25))
                .auth(AuthRequirement {
                    method: "bearer".into(),
                    audience: "aip".into(),
                })
                .build()
                .unwrap(),
        );
        let mut registry = HandlerRegistry::new();
        registry
            .register("classify_intent", Arc::new(SlowHandler))
            .unwrap();
        let router = InvocationRouter::new(
            card,
            Arc::new(registry),
            Arc::new(StaticCostEstimator::new(0.001)),
            CollectingAuditSink::new(),
        );
        let envelope = router.invoke(&request(1.0)).await.into_result().expect_err("timeout");
        assert_eq!(envelope.kind(), ErrorKind::Timeout);
    }

    struct FixedStore {
        result: InvocationResult,
        replays: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl IdempotencyStore for FixedStore {
        async fn seen(&self, _correlation_id: &CorrelationId) -> bool {
            true
        }

        async fn record(&self, _correlation_id: &CorrelationId, _result: &InvocationResult) {}

        async fn replay(&self, _correlation_id: &CorrelationId) -> Option<InvocationResult> {
            self.replays.fetch_add(1, Ordering::SeqCst);
            Some(self.result.clone())
        }
    }

    #[tokio::test]
    async fn replayed_calls_skip_the_handler() {
        let fx = fixture();
        let replays = Arc::new(AtomicUsize::new(0));
        let recorded =
            InvocationResult::success(json!({"intent": "cached"}), Usage::new(1, 0.001, 5));
        let router = fx.router.with_idempotency(Arc::new(FixedStore {
            result: recorded,
            replays: Arc::clone(&replays),
        }));
        let (value, _) = router.invoke(&request(0.05)).await.into_result().expect("value");
        assert_eq!(value["intent"], "cached");
        assert_eq!(replays.load(Ordering::SeqCst), 1);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fx.estimates.load(Ordering::SeqCst), 0);
    }
}
