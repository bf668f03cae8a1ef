//! Canonical failure kinds and their retry classification.
//!
//! Every error that crosses the protocol boundary maps to exactly one
//! [`ErrorKind`]. Each kind carries a stable numeric code, a symbolic reason
//! tag, and a retry class; the client's retry loop is a pure decision over
//! the class, never over exception inspection.

use serde::{Deserialize, Serialize};

/// Whether a failure is eligible for bounded retry by the caller.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryClass {
    /// Eligible for bounded retry (unavailability, timeout, rate limiting).
    Transient,
    /// Must not be retried (budget or validation failure).
    Terminal,
}

/// Canonical protocol failure kinds.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    /// Target unreachable or returned a server-side fault.
    AgentUnavailable,
    /// Declared budget insufficient for the minimum or actual cost.
    BudgetExceeded,
    /// Malformed method, params, or unsupported capability.
    ValidationError,
    /// Exceeded the connect or total call deadline.
    Timeout,
    /// Target is throttling the caller.
    RateLimited,
}

impl ErrorKind {
    /// Returns the stable numeric code for this kind.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::AgentUnavailable => -32000,
            Self::BudgetExceeded => -32001,
            Self::ValidationError => -32002,
            Self::Timeout => -32003,
            Self::RateLimited => -32004,
        }
    }

    /// Returns the symbolic reason tag carried on the wire.
    #[must_use]
    pub const fn reason(self) -> &'static str {
        match self {
            Self::AgentUnavailable => "AGENT_UNAVAILABLE",
            Self::BudgetExceeded => "BUDGET_EXCEEDED",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::RateLimited => "RATE_LIMITED",
        }
    }

    /// Returns the retry classification for this kind.
    #[must_use]
    pub const fn retry_class(self) -> RetryClass {
        match self {
            Self::AgentUnavailable | Self::Timeout | Self::RateLimited => RetryClass::Transient,
            Self::BudgetExceeded | Self::ValidationError => RetryClass::Terminal,
        }
    }

    /// Returns `true` when the caller may retry this failure.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self.retry_class(), RetryClass::Transient)
    }

    /// Resolves a kind from its symbolic reason tag.
    #[must_use]
    pub fn from_reason(reason: &str) -> Option<Self> {
        match reason {
            "AGENT_UNAVAILABLE" => Some(Self::AgentUnavailable),
            "BUDGET_EXCEEDED" => Some(Self::BudgetExceeded),
            "VALIDATION_ERROR" => Some(Self::ValidationError),
            "TIMEOUT" => Some(Self::Timeout),
            "RATE_LIMITED" => Some(Self::RateLimited),
            _ => None,
        }
    }

    /// Resolves a kind from its stable numeric code.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            -32000 => Some(Self::AgentUnavailable),
            -32001 => Some(Self::BudgetExceeded),
            -32002 => Some(Self::ValidationError),
            -32003 => Some(Self::Timeout),
            -32004 => Some(Self::RateLimited),
            _ => None,
        }
    }
}

/// Typed error envelope carried in results and stream events.
///
/// This is the only shape in which failures cross the boundary; raw internal
/// errors and stack traces never appear in a response.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    code: i32,
    message: String,
    reason: String,
}

impl ErrorEnvelope {
    /// Creates an envelope for the supplied kind and message.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            code: kind.code(),
            message: message.into(),
            reason: kind.reason().to_owned(),
        }
    }

    /// Returns the numeric error code.
    #[must_use]
    pub const fn code(&self) -> i32 {
        self.code
    }

    /// Returns the human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the symbolic reason tag.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Resolves the taxonomy kind for this envelope.
    ///
    /// Unrecognised reasons and codes collapse to
    /// [`ErrorKind::AgentUnavailable`], matching the server-side rule for
    /// unmapped failures.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::from_reason(&self.reason)
            .or_else(|| ErrorKind::from_code(self.code))
            .unwrap_or(ErrorKind::AgentUnavailable)
    }

    /// Returns the retry classification for this envelope.
    #[must_use]
    pub fn retry_class(&self) -> RetryClass {
        self.kind().retry_class()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ErrorKind::BudgetExceeded.code(), -32001);
        assert_eq!(ErrorKind::from_code(-32001), Some(ErrorKind::BudgetExceeded));
        for kind in [
            ErrorKind::AgentUnavailable,
            ErrorKind::BudgetExceeded,
            ErrorKind::ValidationError,
            ErrorKind::Timeout,
            ErrorKind::RateLimited,
        ] {
            assert_eq!(ErrorKind::from_code(kind.code()), Some(kind));
            assert_eq!(ErrorKind::from_reason(kind.reason()), Some(kind));
        }
    }

    #[test]
    fn retry_classes_match_taxonomy() {
        assert!(ErrorKind::AgentUnavailable.is_transient());
        assert!(ErrorKind::Timeout.is_transient());
        assert!(ErrorKind::RateLimited.is_transient());
        assert!(!ErrorKind::BudgetExceeded.is_transient());
        assert!(!ErrorKind::ValidationError.is_transient());
    }

    #[test]
    fn unknown_reason_defaults_to_unavailable() {
        let envelope: ErrorEnvelope =
            serde_json::from_str(r#"{"code": -1, "message": "boom", "reason": "WEIRD"}"#)
                .expect("decode");
        assert_eq!(envelope.kind(), ErrorKind::AgentUnavailable);
        assert_eq!(envelope.retry_class(), RetryClass::Transient);
    }

    #[test]
    fn envelope_round_trips() {
        let envelope = ErrorEnvelope::new(ErrorKind::ValidationError, "unknown method");
        let json = serde_json::to_string(&envelope).expect("encode");
        let decoded: ErrorEnvelope = serde_json::from_str(&json).expect("decode");
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.kind(), ErrorKind::ValidationError);
    }
}
