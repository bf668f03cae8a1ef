//! Collaborator interfaces the protocol core depends on but does not implement.

use std::pin::Pin;
use std::sync::Mutex;

use aip_primitives::{CorrelationId, ErrorKind, InvocationResult, Usage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

/// Result alias used by business handlers.
pub type HandlerResult<T> = Result<T, HandlerError>;

/// Stream of incremental chunks produced by a streaming handler.
pub type ChunkStream = Pin<Box<dyn Stream<Item = HandlerResult<HandlerChunk>> + Send>>;

/// Failures a business handler may report.
///
/// These never cross the protocol boundary as-is; the routers classify them
/// into the error taxonomy and sanitize internal detail.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Parameters did not match the method's expected shape.
    #[error("invalid params: {reason}")]
    InvalidParams {
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// The handler's own downstream dependency timed out.
    #[error("handler deadline exceeded")]
    Timeout,

    /// The handler is throttling work.
    #[error("handler rate limited")]
    RateLimited,

    /// A dependency the handler needs is unreachable.
    #[error("handler unavailable: {reason}")]
    Unavailable {
        /// Human-readable context for the failure.
        reason: String,
    },

    /// Any other internal failure.
    #[error("handler error: {0}")]
    Internal(String),
}

impl HandlerError {
    /// Convenience constructor for parameter validation failures.
    #[must_use]
    pub fn invalid_params(reason: impl Into<String>) -> Self {
        Self::InvalidParams {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for unavailability failures.
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for internal failures.
    #[must_use]
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal(reason.into())
    }

    /// Maps the handler failure onto the protocol error taxonomy.
    ///
    /// Internal failures collapse to [`ErrorKind::AgentUnavailable`]; their
    /// detail is logged server-side, never surfaced.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidParams { .. } => ErrorKind::ValidationError,
            Self::Timeout => ErrorKind::Timeout,
            Self::RateLimited => ErrorKind::RateLimited,
            Self::Unavailable { .. } | Self::Internal(_) => ErrorKind::AgentUnavailable,
        }
    }
}

/// Value and usage produced by a completed synchronous handler call.
#[derive(Clone, Debug, PartialEq)]
pub struct HandlerOutput {
    /// Method-specific result payload.
    pub value: Value,
    /// Tokens consumed by the call.
    pub tokens_used: u64,
    /// Actual cost incurred, in USD.
    pub cost_usd: f64,
}

impl HandlerOutput {
    /// Creates a handler output.
    #[must_use]
    pub const fn new(value: Value, tokens_used: u64, cost_usd: f64) -> Self {
        Self {
            value,
            tokens_used,
            cost_usd,
        }
    }
}

/// One incremental chunk of a streamed handler call.
///
/// `tokens_used` and `cost_usd` are the increments attributable to this chunk
/// alone; the streaming router accumulates them into the budget ledger.
#[derive(Clone, Debug, PartialEq)]
pub struct HandlerChunk {
    /// Partial payload delivered to the consumer.
    pub payload: Value,
    /// Tokens consumed producing this chunk.
    pub tokens_used: u64,
    /// Incremental cost of this chunk, in USD.
    pub cost_usd: f64,
}

impl HandlerChunk {
    /// Creates a chunk.
    #[must_use]
    pub const fn new(payload: Value, tokens_used: u64, cost_usd: f64) -> Self {
        Self {
            payload,
            tokens_used,
            cost_usd,
        }
    }
}

/// The domain logic behind one method, opaque to the protocol core.
#[async_trait]
pub trait BusinessHandler: Send + Sync {
    /// Checks `params` against the method's expected shape.
    ///
    /// Runs before any cost estimation or dispatch, so malformed params are a
    /// distinct, structurally-checked failure mode.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::InvalidParams`] when the payload is malformed.
    fn validate_params(&self, params: &Value) -> HandlerResult<()> {
        let _ = params;
        Ok(())
    }

    /// Executes the method once, observing `cancel` for early termination.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerError`] that the router classifies into the
    /// protocol taxonomy.
    async fn handle(&self, params: Value, cancel: crate::CancelSignal)
    -> HandlerResult<HandlerOutput>;

    /// Executes the method as a stream of chunks.
    ///
    /// The default adapts [`handle`](Self::handle) into a single-chunk
    /// stream, so sync-only methods work over the streaming surface.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerError`] when the stream cannot be opened.
    async fn handle_stream(
        &self,
        params: Value,
        cancel: crate::CancelSignal,
    ) -> HandlerResult<ChunkStream> {
        let output = self.handle(params, cancel).await?;
        let chunk = HandlerChunk::new(output.value, output.tokens_used, output.cost_usd);
        Ok(Box::pin(futures::stream::once(async move { Ok(chunk) })))
    }
}

/// External contract consulted before every budget decision.
///
/// Implementations must be pure: same method and params, same estimate, no
/// side effects. How the estimate is priced is out of scope here.
pub trait CostEstimator: Send + Sync {
    /// Returns the minimum cost in USD to execute `method` with `params`.
    fn estimate(&self, method: &str, params: &Value) -> f64;
}

/// Fixed-price estimator keyed by method name; unknown methods cost the
/// configured default.
#[derive(Debug, Default)]
pub struct StaticCostEstimator {
    prices: std::collections::BTreeMap<String, f64>,
    default_usd: f64,
}

impl StaticCostEstimator {
    /// Creates an estimator with the supplied fallback price.
    #[must_use]
    pub fn new(default_usd: f64) -> Self {
        Self {
            prices: std::collections::BTreeMap::new(),
            default_usd,
        }
    }

    /// Sets the price for one method.
    #[must_use]
    pub fn with_price(mut self, method: impl Into<String>, usd: f64) -> Self {
        self.prices.insert(method.into(), usd);
        self
    }
}

impl CostEstimator for StaticCostEstimator {
    fn estimate(&self, method: &str, _params: &Value) -> f64 {
        self.prices.get(method).copied().unwrap_or(self.default_usd)
    }
}

/// Terminal disposition of an audited call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AuditOutcome {
    /// Call completed and returned a value.
    Completed,
    /// Call failed; the tag is the taxonomy reason surfaced to the caller.
    Failed(String),
}

/// Structured record emitted after every completed or failed call.
#[derive(Clone, Debug, PartialEq)]
pub struct AuditEvent {
    /// Invoked method name.
    pub method: String,
    /// Caller-supplied correlation identifier.
    pub correlation_id: CorrelationId,
    /// How the call ended.
    pub outcome: AuditOutcome,
    /// Usage accumulated by the call, when known.
    pub usage: Option<Usage>,
    /// When the call finished.
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    /// Creates an audit event stamped with the current time.
    #[must_use]
    pub fn now(
        method: impl Into<String>,
        correlation_id: CorrelationId,
        outcome: AuditOutcome,
        usage: Option<Usage>,
    ) -> Self {
        Self {
            method: method.into(),
            correlation_id,
            outcome,
            usage,
            occurred_at: Utc::now(),
        }
    }
}

/// Collaborator that receives audit events; persistence is out of scope.
pub trait AuditSink: Send + Sync {
    /// Records one audit event.
    fn record(&self, event: AuditEvent);
}

/// Sink that emits audit events to the tracing system.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        info!(
            method = %event.method,
            correlation_id = %event.correlation_id,
            outcome = ?event.outcome,
            usage = ?event.usage,
            "call audited"
        );
    }
}

/// Sink used during testing to capture audit events.
#[derive(Debug, Default)]
pub struct CollectingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl CollectingAuditSink {
    /// Creates a new collecting sink behind an `Arc`.
    #[must_use]
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    /// Returns the collected events, clearing the buffer.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex was poisoned by a previous panic.
    #[must_use]
    pub fn drain(&self) -> Vec<AuditEvent> {
        let mut lock = self.events.lock().expect("audit sink poisoned");
        lock.drain(..).collect()
    }
}

impl AuditSink for CollectingAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events
            .lock()
            .expect("audit sink poisoned")
            .push(event);
    }
}

/// External replay-safety collaborator.
///
/// Consistency guarantees (dedup window, storage, behaviour under concurrent
/// replays) belong to the implementation, not to the protocol core. Only
/// synchronous invocations are replayed; streams never are.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Returns `true` when the correlation id has been seen before.
    async fn seen(&self, correlation_id: &CorrelationId) -> bool;

    /// Records the result produced for a correlation id.
    async fn record(&self, correlation_id: &CorrelationId, result: &InvocationResult);

    /// Returns the previously recorded result, if any.
    async fn replay(&self, correlation_id: &CorrelationId) -> Option<InvocationResult>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use aip_primitives::RetryClass;

    #[test]
    fn handler_errors_map_onto_taxonomy() {
        assert_eq!(
            HandlerError::invalid_params("bad").kind(),
            ErrorKind::ValidationError
        );
        assert_eq!(HandlerError::Timeout.kind(), ErrorKind::Timeout);
        assert_eq!(HandlerError::RateLimited.kind(), ErrorKind::RateLimited);
        assert_eq!(
            HandlerError::internal("secret detail").kind(),
            ErrorKind::AgentUnavailable
        );
        assert_eq!(
            HandlerError::internal("x").kind().retry_class(),
            RetryClass::Transient
        );
    }

    #[test]
    fn static_estimator_prices_by_method() {
        let estimator = StaticCostEstimator::new(0.01).with_price("classify_intent", 0.002);
        assert!((estimator.estimate("classify_intent", &Value::Null) - 0.002).abs() < 1e-12);
        assert!((estimator.estimate("unknown", &Value::Null) - 0.01).abs() < 1e-12);
    }

    #[test]
    fn collecting_sink_drains_in_order() {
        let sink = CollectingAuditSink::new();
        let id = CorrelationId::new("a-1").unwrap();
        sink.record(AuditEvent::now("m", id.clone(), AuditOutcome::Completed, None));
        sink.record(AuditEvent::now(
            "m",
            id,
            AuditOutcome::Failed("TIMEOUT".into()),
            None,
        ));
        let events = sink.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].outcome, AuditOutcome::Completed);
        assert!(sink.drain().is_empty());
    }
}
