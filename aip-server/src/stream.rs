//! Streamed invocation pipeline.

use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aip_primitives::{
    CapabilityCard, CorrelationId, ErrorEnvelope, ErrorKind, InvocationRequest, StreamEvent, Usage,
};
use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::budget::BudgetLedger;
use crate::cancel::cancel_pair;
use crate::registry::HandlerRegistry;
use crate::router::classify_handler_error;
use crate::traits::{AuditEvent, AuditOutcome, AuditSink, CostEstimator};

/// Lazily produced sequence of stream events for one invocation.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Phases of a streamed invocation.
///
/// All right-hand states are terminal; there are no transitions out of them.
/// `Cancelled` is reachable from `Streaming` only, triggered by consumer
/// disconnect, and always precedes resource cleanup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamPhase {
    /// Request received, nothing checked yet.
    Init,
    /// Pre-checks (capability, params, budget) passed.
    Validated,
    /// Handler stream requested.
    Dispatched,
    /// Chunks are flowing to the consumer.
    Streaming,
    /// Stream finished normally with a final usage event.
    Completed,
    /// Committed cost crossed the declared budget mid-stream.
    BudgetAborted,
    /// Handler or transport failure ended the stream.
    Failed,
    /// Consumer disconnected; cancellation was propagated to the handler.
    Cancelled,
}

impl StreamPhase {
    /// Returns `true` for terminal phases.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::BudgetAborted | Self::Failed | Self::Cancelled
        )
    }

    /// Applies a phase transition, returning the new phase.
    ///
    /// # Errors
    ///
    /// Returns [`StreamPhaseError::InvalidTransition`] when the move is not
    /// permitted from the current phase.
    pub fn transition(self, next: Self) -> StreamPhaseResult<Self> {
        let allowed = matches!(
            (self, next),
            (Self::Init, Self::Validated)
                | (Self::Validated, Self::Dispatched)
                | (Self::Dispatched, Self::Streaming | Self::Failed)
                | (
                    Self::Streaming,
                    Self::Completed | Self::BudgetAborted | Self::Failed | Self::Cancelled
                )
        );
        if allowed {
            Ok(next)
        } else {
            Err(StreamPhaseError::InvalidTransition { from: self, next })
        }
    }
}

/// Errors emitted by the stream phase machine.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamPhaseError {
    /// Transition was not permitted from the current phase.
    #[error("invalid stream transition from {from:?} to {next:?}")]
    InvalidTransition {
        /// Phase prior to the attempted transition.
        from: StreamPhase,
        /// Phase that was requested.
        next: StreamPhase,
    },
}

/// Result alias for phase transitions.
pub type StreamPhaseResult<T> = Result<T, StreamPhaseError>;

/// Tuning knobs for the streaming router.
#[derive(Clone, Copy, Debug)]
pub struct StreamConfig {
    chunk_timeout: Duration,
    channel_capacity: usize,
}

impl StreamConfig {
    /// Creates a config with the supplied per-chunk inactivity deadline and
    /// event channel capacity.
    #[must_use]
    pub const fn new(chunk_timeout: Duration, channel_capacity: usize) -> Self {
        Self {
            chunk_timeout,
            channel_capacity,
        }
    }

    /// Returns the per-chunk inactivity deadline.
    #[must_use]
    pub const fn chunk_timeout(self) -> Duration {
        self.chunk_timeout
    }

    /// Returns the event channel capacity.
    #[must_use]
    pub const fn channel_capacity(self) -> usize {
        self.channel_capacity
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StreamPhaseError::InvalidTransition`]-free config errors as
    /// a plain string, used at construction time only.
    pub fn validate(self) -> Result<(), &'static str> {
        if self.chunk_timeout.is_zero() {
            return Err("chunk timeout must be greater than zero");
        }
        if self.channel_capacity == 0 {
            return Err("channel capacity must be greater than zero");
        }
        Ok(())
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_timeout: Duration::from_secs(10),
            channel_capacity: 16,
        }
    }
}

/// Dispatches streamed invocations and enforces the budget per chunk.
pub struct StreamingRouter {
    card: Arc<CapabilityCard>,
    registry: Arc<HandlerRegistry>,
    estimator: Arc<dyn CostEstimator>,
    audit: Arc<dyn AuditSink>,
    config: StreamConfig,
}

impl StreamingRouter {
    /// Creates a streaming router over the loaded card and collaborators.
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
            config: StreamConfig::default(),
        }
    }

    /// Overrides the streaming configuration.
    #[must_use]
    pub const fn with_config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    /// Executes one streamed invocation.
    ///
    /// The returned stream is lazy, finite, bound to one connection, and not
    /// restartable. Pre-check failures surface as a single final error event
    /// rather than a transport failure.
    #[must_use]
    pub fn invoke_stream(&self, request: InvocationRequest) -> EventStream {
        let method = request.method().to_owned();
        let correlation_id = request.correlation_id().clone();

        if let Err(err) = request.validate() {
            return self.precheck_failure(
                &method,
                &correlation_id,
                ErrorEnvelope::new(ErrorKind::ValidationError, err.to_string()),
            );
        }
        if !self.card.supports(&method) {
            return self.precheck_failure(
                &method,
                &correlation_id,
                ErrorEnvelope::new(
                    ErrorKind::ValidationError,
                    format!("method `{method}` is not advertised by this agent"),
                ),
            );
        }
        let Some(handler) = self.registry.get(&method) else {
            warn!(method, "capability advertised without a mounted handler");
            return self.precheck_failure(
                &method,
                &correlation_id,
                ErrorEnvelope::new(ErrorKind::AgentUnavailable, "capability is not mounted"),
            );
        };
        let handler = Arc::clone(handler);

        if let Err(err) = handler.validate_params(request.params()) {
            let envelope = classify_handler_error(&method, &err);
            return self.precheck_failure(&method, &correlation_id, envelope);
        }

        let minimum = self.estimator.estimate(&method, request.params());
        let ledger = BudgetLedger::new(request.budget_usd());
        if !ledger.covers(minimum) {
            return self.precheck_failure(
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

        let (tx, rx) = mpsc::channel::<StreamEvent>(self.config.channel_capacity);
        let worker = StreamWorker {
            method,
            correlation_id,
            params: request.params().clone(),
            handler,
            ledger,
            audit: Arc::clone(&self.audit),
            chunk_timeout: self.config.chunk_timeout,
            overall_deadline: Duration::from_millis(self.card.limits().max_latency_ms()),
        };
        tokio::spawn(worker.run(tx));

        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        }))
    }

    fn precheck_failure(
        &self,
        method: &str,
        correlation_id: &CorrelationId,
        envelope: ErrorEnvelope,
    ) -> EventStream {
        self.audit.record(AuditEvent::now(
            method,
            correlation_id.clone(),
            AuditOutcome::Failed(envelope.reason().to_owned()),
            None,
        ));
        let event = StreamEvent::failed(0, envelope, None);
        Box::pin(futures::stream::once(async move { event }))
    }
}

struct StreamWorker {
    method: String,
    correlation_id: CorrelationId,
    params: serde_json::Value,
    handler: Arc<dyn crate::traits::BusinessHandler>,
    ledger: BudgetLedger,
    audit: Arc<dyn AuditSink>,
    chunk_timeout: Duration,
    overall_deadline: Duration,
}

impl StreamWorker {
    async fn run(mut self, tx: mpsc::Sender<StreamEvent>) {
        let mut phase = StreamPhase::Validated;
        let started = Instant::now();
        let (cancel_handle, cancel_signal) = cancel_pair();

        advance(&mut phase, StreamPhase::Dispatched);
        let mut chunks = match self.handler.handle_stream(self.params.clone(), cancel_signal).await
        {
            Ok(chunks) => chunks,
            Err(err) => {
                let envelope = classify_handler_error(&self.method, &err);
                advance(&mut phase, StreamPhase::Failed);
                self.finish(&tx, 0, envelope, None, phase).await;
                return;
            }
        };
        advance(&mut phase, StreamPhase::Streaming);

        let overall = tokio::time::sleep(self.overall_deadline);
        tokio::pin!(overall);

        let mut sequence: u64 = 0;
        let mut tokens_used: u64 = 0;

        loop {
            tokio::select! {
                // Consumer disconnect: propagate cancellation before any
                // cleanup, and never write another event.
                () = tx.closed() => {
                    cancel_handle.cancel();
                    advance(&mut phase, StreamPhase::Cancelled);
                    drop(chunks);
                    self.audit_terminal(phase, self.partial_usage(tokens_used, started));
                    debug!(method = %self.method, "stream cancelled by consumer disconnect");
                    return;
                }
                () = &mut overall => {
                    cancel_handle.cancel();
                    advance(&mut phase, StreamPhase::Failed);
                    drop(chunks);
                    let envelope = ErrorEnvelope::new(
                        ErrorKind::Timeout,
                        format!(
                            "stream exceeded the {}ms overall deadline",
                            self.overall_deadline.as_millis()
                        ),
                    );
                    let usage = self.partial_usage(tokens_used, started);
                    self.finish(&tx, sequence, envelope, Some(usage), phase).await;
                    return;
                }
                next = timeout(self.chunk_timeout, chunks.next()) => match next {
                    // A stalled stream is cleaned up identically to a disconnect.
                    Err(_) => {
                        cancel_handle.cancel();
                        advance(&mut phase, StreamPhase::Failed);
                        drop(chunks);
                        let envelope = ErrorEnvelope::new(
                            ErrorKind::Timeout,
                            format!(
                                "no chunk within the {}ms inactivity deadline",
                                self.chunk_timeout.as_millis()
                            ),
                        );
                        let usage = self.partial_usage(tokens_used, started);
                        self.finish(&tx, sequence, envelope, Some(usage), phase).await;
                        return;
                    }
                    Ok(None) => {
                        advance(&mut phase, StreamPhase::Completed);
                        let usage = self.partial_usage(tokens_used, started);
                        if tx.send(StreamEvent::completed(sequence, usage)).await.is_err() {
                            warn!(method = %self.method, "consumer vanished before final event");
                        }
                        self.audit_terminal(phase, usage);
                        return;
                    }
                    Ok(Some(Err(err))) => {
                        let envelope = classify_handler_error(&self.method, &err);
                        advance(&mut phase, StreamPhase::Failed);
                        drop(chunks);
                        let usage = self.partial_usage(tokens_used, started);
                        self.finish(&tx, sequence, envelope, Some(usage), phase).await;
                        return;
                    }
                    Ok(Some(Ok(chunk))) => {
                        tokens_used += chunk.tokens_used;
                        if let Err(breach) = self.ledger.commit(chunk.cost_usd) {
                            // Stop pulling immediately; delivered chunks are
                            // not retracted.
                            cancel_handle.cancel();
                            advance(&mut phase, StreamPhase::BudgetAborted);
                            drop(chunks);
                            let usage = self.partial_usage(tokens_used, started);
                            self.finish(&tx, sequence, breach.to_envelope(), Some(usage), phase)
                                .await;
                            return;
                        }
                        let event = StreamEvent::chunk(sequence, chunk.payload);
                        sequence += 1;
                        if tx.send(event).await.is_err() {
                            cancel_handle.cancel();
                            advance(&mut phase, StreamPhase::Cancelled);
                            drop(chunks);
                            self.audit_terminal(phase, self.partial_usage(tokens_used, started));
                            return;
                        }
                    }
                }
            }
        }
    }

    fn partial_usage(&self, tokens_used: u64, started: Instant) -> Usage {
        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = started.elapsed().as_millis() as u64;
        Usage::new(tokens_used, self.ledger.committed_usd(), duration_ms)
    }

    async fn finish(
        &self,
        tx: &mpsc::Sender<StreamEvent>,
        sequence: u64,
        envelope: ErrorEnvelope,
        usage: Option<Usage>,
        phase: StreamPhase,
    ) {
        let event = StreamEvent::failed(sequence, envelope, usage);
        if tx.send(event).await.is_err() {
            debug!(method = %self.method, "consumer vanished before error event");
        }
        self.audit_terminal(phase, usage.unwrap_or_default());
    }

    fn audit_terminal(&self, phase: StreamPhase, usage: Usage) {
        let outcome = match phase {
            StreamPhase::Completed => AuditOutcome::Completed,
            StreamPhase::BudgetAborted => {
                AuditOutcome::Failed(ErrorKind::BudgetExceeded.reason().to_owned())
            }
            StreamPhase::Cancelled => AuditOutcome::Failed("CANCELLED".to_owned()),
            _ => AuditOutcome::Failed(ErrorKind::AgentUnavailable.reason().to_owned()),
        };
        self.audit.record(AuditEvent::now(
            &self.method,
            self.correlation_id.clone(),
            outcome,
            Some(usage),
        ));
    }
}

fn advance(phase: &mut StreamPhase, next: StreamPhase) {
    match phase.transition(next) {
        Ok(new_phase) => {
            debug!(?phase, ?new_phase, "stream phase transition");
            *phase = new_phase;
        }
        Err(err) => warn!(%err, "stream phase bug"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HandlerRegistry;
    use crate::traits::{
        BusinessHandler, ChunkStream, CollectingAuditSink, HandlerChunk, HandlerOutput,
        HandlerResult, StaticCostEstimator,
    };
    use aip_primitives::{AuthRequirement, CardLimits};
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn terminal_phases_admit_no_transitions() {
        for terminal in [
            StreamPhase::Completed,
            StreamPhase::BudgetAborted,
            StreamPhase::Failed,
            StreamPhase::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            assert!(terminal.transition(StreamPhase::Streaming).is_err());
        }
    }

    #[test]
    fn cancelled_only_reachable_from_streaming() {
        assert!(StreamPhase::Streaming.transition(StreamPhase::Cancelled).is_ok());
        assert!(StreamPhase::Dispatched.transition(StreamPhase::Cancelled).is_err());
        assert!(StreamPhase::Validated.transition(StreamPhase::Cancelled).is_err());
    }

    fn card() -> Arc<CapabilityCard> {
        Arc::new(
            CapabilityCard::builder("planner")
                .version("1.0.0")
                .capability("draft_plan")
                .limits(CardLimits::new(8192, 2048, 10_000, 0.25))
                .auth(AuthRequirement {
                    method: "bearer".into(),
                    audience: "aip".into(),
                })
                .build()
                .unwrap(),
        )
    }

    struct ChunkingHandler {
        chunks: usize,
        cost_per_chunk: f64,
    }

    #[async_trait]
    impl BusinessHandler for ChunkingHandler {
        async fn handle(
            &self,
            _params: Value,
            _cancel: crate::CancelSignal,
        ) -> HandlerResult<HandlerOutput> {
            Ok(HandlerOutput::new(Value::Null, 0, 0.0))
        }

        async fn handle_stream(
            &self,
            _params: Value,
            _cancel: crate::CancelSignal,
        ) -> HandlerResult<ChunkStream> {
            let cost = self.cost_per_chunk;
            let stream = futures::stream::iter(
                (0..self.chunks)
                    .map(move |i| Ok(HandlerChunk::new(json!({"part": i}), 5, cost))),
            );
            Ok(Box::pin(stream))
        }
    }

    fn router(handler: Arc<dyn BusinessHandler>) -> (StreamingRouter, Arc<CollectingAuditSink>) {
        let mut registry = HandlerRegistry::new();
        registry.register("draft_plan", handler).unwrap();
        let audit = CollectingAuditSink::new();
        let router = StreamingRouter::new(
            card(),
            Arc::new(registry),
            Arc::new(StaticCostEstimator::new(0.001)),
            audit.clone(),
        );
        (router, audit)
    }

    fn request(budget: f64) -> InvocationRequest {
        InvocationRequest::new(
            "draft_plan",
            json!({"goal": "gain muscle"}),
            CorrelationId::new("stream-1").unwrap(),
            budget,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn completes_with_final_usage_event() {
        let (router, audit) = router(Arc::new(ChunkingHandler {
            chunks: 3,
            cost_per_chunk: 0.001,
        }));
        let events: Vec<StreamEvent> = router.invoke_stream(request(1.0)).collect().await;

        assert_eq!(events.len(), 4);
        for (i, event) in events.iter().take(3).enumerate() {
            assert_eq!(event.sequence(), i as u64);
            assert!(!event.is_final());
        }
        let last = events.last().unwrap();
        assert!(last.is_final());
        assert!(last.error().is_none());
        let usage = last.usage().expect("usage");
        assert_eq!(usage.tokens_used, 15);
        assert!((usage.cost_usd - 0.003).abs() < 1e-9);

        let audited = audit.drain();
        assert_eq!(audited.len(), 1);
        assert_eq!(audited[0].outcome, AuditOutcome::Completed);
    }

    #[tokio::test]
    async fn mid_stream_budget_breach_aborts_after_exact_chunks() {
        // Budget covers three chunks of 0.01; the fourth commit breaches.
        let (router, _) = router(Arc::new(ChunkingHandler {
            chunks: 10,
            cost_per_chunk: 0.01,
        }));
        let events: Vec<StreamEvent> = router.invoke_stream(request(0.03)).collect().await;

        assert_eq!(events.len(), 4);
        assert!(events[..3].iter().all(|e| !e.is_final()));
        let last = &events[3];
        assert!(last.is_final());
        let error = last.error().expect("budget error");
        assert_eq!(error.reason(), "BUDGET_EXCEEDED");
        let usage = last.usage().expect("partial usage");
        assert!(usage.cost_usd > 0.03);
    }

    #[tokio::test]
    async fn budget_below_estimate_emits_single_error_event() {
        let (router, _) = router(Arc::new(ChunkingHandler {
            chunks: 3,
            cost_per_chunk: 0.001,
        }));
        let events: Vec<StreamEvent> = router.invoke_stream(request(0.0001)).collect().await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_final());
        assert_eq!(events[0].error().unwrap().reason(), "BUDGET_EXCEEDED");
    }

    struct EndlessHandler {
        cancelled: Arc<AtomicBool>,
    }

    #[async_trait]
    impl BusinessHandler for EndlessHandler {
        async fn handle(
            &self,
            _params: Value,
            _cancel: crate::CancelSignal,
        ) -> HandlerResult<HandlerOutput> {
            Ok(HandlerOutput::new(Value::Null, 0, 0.0))
        }

        async fn handle_stream(
            &self,
            _params: Value,
            cancel: crate::CancelSignal,
        ) -> HandlerResult<ChunkStream> {
            let flag = Arc::clone(&self.cancelled);
            let watcher = cancel.clone();
            tokio::spawn(async move {
                watcher.cancelled().await;
                flag.store(true, Ordering::SeqCst);
            });
            let stream = futures::stream::unfold(0u64, |i| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Some((Ok(HandlerChunk::new(json!({"tick": i}), 1, 0.0001)), i + 1))
            });
            Ok(Box::pin(stream))
        }
    }

    #[tokio::test]
    async fn consumer_disconnect_propagates_cancellation() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let (router, audit) = router(Arc::new(EndlessHandler {
            cancelled: Arc::clone(&cancelled),
        }));

        let mut stream = router.invoke_stream(request(1.0));
        let first = stream.next().await.expect("first chunk");
        let second = stream.next().await.expect("second chunk");
        assert_eq!(first.sequence(), 0);
        assert_eq!(second.sequence(), 1);
        drop(stream);

        // The worker observes the closed channel within one chunk interval.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cancelled.load(Ordering::SeqCst));
        let events = audit.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, AuditOutcome::Failed("CANCELLED".into()));
    }

    struct StallingHandler;

    #[async_trait]
    impl BusinessHandler for StallingHandler {
        async fn handle(
            &self,
            _params: Value,
            _cancel: crate::CancelSignal,
        ) -> HandlerResult<HandlerOutput> {
            Ok(HandlerOutput::new(Value::Null, 0, 0.0))
        }

        async fn handle_stream(
            &self,
            _params: Value,
            _cancel: crate::CancelSignal,
        ) -> HandlerResult<ChunkStream> {
            let stream = futures::stream::unfold(0u64, |i| async move {
                if i == 0 {
                    Some((Ok(HandlerChunk::new(json!({"part": 0}), 1, 0.0001)), 1))
                } else {
                    futures::future::pending::<()>().await;
                    None
                }
            });
            Ok(Box::pin(stream))
        }
    }

    #[tokio::test]
    async fn stalled_stream_is_a_timeout() {
        let (router, _) = router(Arc::new(StallingHandler));
        let router = router.with_config(StreamConfig::new(Duration::from_millis(30), 16));
        let events: Vec<StreamEvent> = router.invoke_stream(request(1.0)).collect().await;

        assert_eq!(events.len(), 2);
        let last = events.last().unwrap();
        assert!(last.is_final());
        assert_eq!(last.error().unwrap().reason(), "TIMEOUT");
    }
}
