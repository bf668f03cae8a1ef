//! Wire types exchanged between protocol peers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::ids::CorrelationId;
use crate::taxonomy::{ErrorEnvelope, ErrorKind};
use crate::card::CardLimits;

/// Protocol version constant attached to every invocation request.
pub const PROTOCOL_VERSION: &str = "aip/1";

/// Header carrying the correlation identifier on `/invoke*` calls.
pub const CORRELATION_HEADER: &str = "x-aip-correlation-id";

/// Header carrying the declared budget on `/invoke*` calls.
pub const BUDGET_HEADER: &str = "x-aip-budget-usd";

/// A single request/response or stream invocation submitted to an agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    protocol_version: String,
    method: String,
    params: Value,
    correlation_id: CorrelationId,
    budget_usd: f64,
}

impl InvocationRequest {
    /// Creates a validated invocation request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] when the method name is empty or the
    /// budget is not a finite non-negative amount.
    pub fn new(
        method: impl Into<String>,
        params: Value,
        correlation_id: CorrelationId,
        budget_usd: f64,
    ) -> Result<Self> {
        let request = Self {
            protocol_version: PROTOCOL_VERSION.to_owned(),
            method: method.into(),
            params,
            correlation_id,
            budget_usd,
        };
        request.validate()?;
        Ok(request)
    }

    /// Re-validates a request decoded from the wire.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] on a version mismatch, an empty
    /// method name, or a budget that is not finite and non-negative.
    pub fn validate(&self) -> Result<()> {
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(Error::invalid_request(format!(
                "unsupported protocol version `{}` (expected `{PROTOCOL_VERSION}`)",
                self.protocol_version
            )));
        }
        if self.method.trim().is_empty() {
            return Err(Error::invalid_request("method cannot be empty"));
        }
        if !self.budget_usd.is_finite() || self.budget_usd < 0.0 {
            return Err(Error::invalid_request(
                "budget must be a finite non-negative amount",
            ));
        }
        Ok(())
    }

    /// Returns the protocol version declared by the caller.
    #[must_use]
    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    /// Returns the requested method name.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Returns the method-specific parameters payload.
    #[must_use]
    pub const fn params(&self) -> &Value {
        &self.params
    }

    /// Returns the caller-supplied correlation identifier.
    #[must_use]
    pub const fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Returns the caller-declared spending ceiling in USD.
    #[must_use]
    pub const fn budget_usd(&self) -> f64 {
        self.budget_usd
    }
}

/// Resource usage reported with a completed call or final stream event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    /// Total tokens consumed by the invocation.
    pub tokens_used: u64,
    /// Actual cost incurred, in USD.
    pub cost_usd: f64,
    /// Wall-clock duration of the invocation in milliseconds.
    pub duration_ms: u64,
}

impl Usage {
    /// Creates a usage block.
    #[must_use]
    pub const fn new(tokens_used: u64, cost_usd: f64, duration_ms: u64) -> Self {
        Self {
            tokens_used,
            cost_usd,
            duration_ms,
        }
    }
}

/// Outcome of a synchronous invocation: exactly one of value or error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvocationResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorEnvelope>,
}

impl InvocationResult {
    /// Creates a successful result carrying the handler value and usage.
    #[must_use]
    pub const fn success(value: Value, usage: Usage) -> Self {
        Self {
            value: Some(value),
            usage: Some(usage),
            error: None,
        }
    }

    /// Creates a failed result carrying a typed error envelope.
    #[must_use]
    pub const fn failure(error: ErrorEnvelope) -> Self {
        Self {
            value: None,
            usage: None,
            error: Some(error),
        }
    }

    /// Returns `true` when the result carries an error envelope.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Returns the error envelope, if any.
    #[must_use]
    pub const fn error(&self) -> Option<&ErrorEnvelope> {
        self.error.as_ref()
    }

    /// Returns the usage block, if present.
    #[must_use]
    pub const fn usage(&self) -> Option<&Usage> {
        self.usage.as_ref()
    }

    /// Converts the wire shape into an explicit `Result`.
    ///
    /// A result that carries neither value nor error is itself a protocol
    /// violation and maps to [`ErrorKind::AgentUnavailable`].
    ///
    /// # Errors
    ///
    /// Returns the carried [`ErrorEnvelope`] when the invocation failed.
    pub fn into_result(self) -> std::result::Result<(Value, Usage), ErrorEnvelope> {
        if let Some(error) = self.error {
            return Err(error);
        }
        match (self.value, self.usage) {
            (Some(value), Some(usage)) => Ok((value, usage)),
            _ => Err(ErrorEnvelope::new(
                ErrorKind::AgentUnavailable,
                "result carried neither value nor error",
            )),
        }
    }
}

/// Pre-flight capability and budget proposal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NegotiationRequest {
    capabilities: Vec<String>,
    budget_usd: f64,
}

impl NegotiationRequest {
    /// Creates a negotiation request.
    #[must_use]
    pub const fn new(capabilities: Vec<String>, budget_usd: f64) -> Self {
        Self {
            capabilities,
            budget_usd,
        }
    }

    /// Returns the requested capability subset.
    #[must_use]
    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    /// Returns the proposed budget in USD.
    #[must_use]
    pub const fn budget_usd(&self) -> f64 {
        self.budget_usd
    }
}

/// Outcome tag of a negotiation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationOutcome {
    /// Full requested overlap is serveable within budget.
    Accepted,
    /// A reduced scope is serveable; reduced limits are stated explicitly.
    Degraded,
    /// Nothing serveable; the reason tag names why.
    Rejected,
}

/// Result of matching a proposal against the capability card.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NegotiationResult {
    outcome: NegotiationOutcome,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    accepted: Vec<String>,
    minimum_cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    limits: Option<CardLimits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

impl NegotiationResult {
    /// Creates an accepted result with the full overlapping capability set.
    #[must_use]
    pub const fn accepted(accepted: Vec<String>, minimum_cost_usd: f64) -> Self {
        Self {
            outcome: NegotiationOutcome::Accepted,
            accepted,
            minimum_cost_usd,
            limits: None,
            reason: None,
        }
    }

    /// Creates a degraded result stating the reduced limits explicitly.
    #[must_use]
    pub const fn degraded(
        accepted: Vec<String>,
        minimum_cost_usd: f64,
        limits: CardLimits,
    ) -> Self {
        Self {
            outcome: NegotiationOutcome::Degraded,
            accepted,
            minimum_cost_usd,
            limits: Some(limits),
            reason: None,
        }
    }

    /// Creates a rejected result tagged with a taxonomy reason.
    #[must_use]
    pub fn rejected(kind: ErrorKind, minimum_cost_usd: f64) -> Self {
        Self {
            outcome: NegotiationOutcome::Rejected,
            accepted: Vec::new(),
            minimum_cost_usd,
            limits: None,
            reason: Some(kind.reason().to_owned()),
        }
    }

    /// Returns the negotiation outcome tag.
    #[must_use]
    pub const fn outcome(&self) -> NegotiationOutcome {
        self.outcome
    }

    /// Returns the accepted capability subset (empty when rejected).
    #[must_use]
    pub fn accepted_set(&self) -> &[String] {
        &self.accepted
    }

    /// Returns the minimum viable cost estimate in USD.
    #[must_use]
    pub const fn minimum_cost_usd(&self) -> f64 {
        self.minimum_cost_usd
    }

    /// Returns the reduced limits stated for a degraded outcome.
    #[must_use]
    pub const fn limits(&self) -> Option<&CardLimits> {
        self.limits.as_ref()
    }

    /// Returns the rejection reason tag, if any.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

/// One event in a streamed invocation.
///
/// Sequence numbers are monotonic from zero per stream; a gap observed by the
/// consumer is a protocol violation, never a skippable condition. The last
/// event always has `final = true` and, on normal completion, carries the
/// same usage block a synchronous result would.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chunk: Option<Value>,
    #[serde(rename = "final")]
    is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorEnvelope>,
}

impl StreamEvent {
    /// Creates a data event carrying one chunk.
    #[must_use]
    pub const fn chunk(sequence: u64, chunk: Value) -> Self {
        Self {
            sequence,
            chunk: Some(chunk),
            is_final: false,
            usage: None,
            error: None,
        }
    }

    /// Creates the final event of a normally completed stream.
    #[must_use]
    pub const fn completed(sequence: u64, usage: Usage) -> Self {
        Self {
            sequence,
            chunk: None,
            is_final: true,
            usage: Some(usage),
            error: None,
        }
    }

    /// Creates the final event of a failed or aborted stream.
    ///
    /// Partial usage accumulated before the failure is attached when known.
    #[must_use]
    pub const fn failed(sequence: u64, error: ErrorEnvelope, usage: Option<Usage>) -> Self {
        Self {
            sequence,
            chunk: None,
            is_final: true,
            usage,
            error: Some(error),
        }
    }

    /// Returns the per-stream sequence number.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns the partial payload, if this is a data event.
    #[must_use]
    pub const fn chunk_payload(&self) -> Option<&Value> {
        self.chunk.as_ref()
    }

    /// Returns `true` for the terminal event of a stream.
    #[must_use]
    pub const fn is_final(&self) -> bool {
        self.is_final
    }

    /// Returns the usage block attached to a final event.
    #[must_use]
    pub const fn usage(&self) -> Option<&Usage> {
        self.usage.as_ref()
    }

    /// Returns the error envelope attached to a failed final event.
    #[must_use]
    pub const fn error(&self) -> Option<&ErrorEnvelope> {
        self.error.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> InvocationRequest {
        InvocationRequest::new(
            "classify_intent",
            json!({"message": "I want a plan"}),
            CorrelationId::new("req-1").unwrap(),
            0.05,
        )
        .unwrap()
    }

    #[test]
    fn request_carries_protocol_version() {
        let request = request();
        assert_eq!(request.protocol_version(), PROTOCOL_VERSION);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn request_rejects_negative_budget() {
        let err = InvocationRequest::new(
            "classify_intent",
            json!({}),
            CorrelationId::new("req-2").unwrap(),
            -0.01,
        )
        .expect_err("negative budget");
        assert!(matches!(err, Error::InvalidRequest { .. }));
    }

    #[test]
    fn wire_request_with_wrong_version_fails_validation() {
        let decoded: InvocationRequest = serde_json::from_value(json!({
            "protocol_version": "aip/0",
            "method": "classify_intent",
            "params": {},
            "correlation_id": "req-3",
            "budget_usd": 0.05
        }))
        .expect("decode");
        assert!(decoded.validate().is_err());
    }

    #[test]
    fn result_is_exactly_one_of_value_or_error() {
        let ok = InvocationResult::success(json!({"intent": "plan"}), Usage::new(12, 0.002, 40));
        assert!(!ok.is_error());
        let (value, usage) = ok.into_result().expect("value");
        assert_eq!(value["intent"], "plan");
        assert!((usage.cost_usd - 0.002).abs() < f64::EPSILON);

        let failed = InvocationResult::failure(ErrorEnvelope::new(
            ErrorKind::BudgetExceeded,
            "budget below minimum",
        ));
        let envelope = failed.into_result().expect_err("error");
        assert_eq!(envelope.code(), -32001);
    }

    #[test]
    fn empty_result_maps_to_unavailable() {
        let hollow: InvocationResult = serde_json::from_value(json!({})).expect("decode");
        let envelope = hollow.into_result().expect_err("violation");
        assert_eq!(envelope.kind(), ErrorKind::AgentUnavailable);
    }

    #[test]
    fn stream_event_final_field_name_on_wire() {
        let event = StreamEvent::completed(4, Usage::new(100, 0.01, 900));
        let json = serde_json::to_value(&event).expect("encode");
        assert_eq!(json["final"], json!(true));
        assert_eq!(json["sequence"], json!(4));
    }
}
