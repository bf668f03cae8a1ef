//! Client-side error types.

use aip_primitives::ErrorEnvelope;
use thiserror::Error;

/// Result alias used throughout the client crate.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the protocol client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Client construction or configuration failed.
    #[error("configuration error: {reason}")]
    Configuration {
        /// Human-readable description of the problem.
        reason: String,
    },

    /// The HTTP exchange itself failed.
    #[error("transport error: {reason}")]
    Transport {
        /// Human-readable description of the failure.
        reason: String,
    },

    /// A connect, request, or stream deadline expired client-side.
    ///
    /// Mirrors the `TIMEOUT` taxonomy class; retried like any other
    /// transient failure.
    #[error("deadline exceeded: {reason}")]
    Timeout {
        /// Which deadline expired.
        reason: String,
    },

    /// The agent returned a typed protocol error that was not (or no longer)
    /// retryable.
    #[error("agent error {}: {}", .0.code(), .0.message())]
    Agent(ErrorEnvelope),

    /// The response violated the protocol: undecodable payload, sequence
    /// gap, or a stream without a final event.
    #[error("protocol violation: {reason}")]
    Protocol {
        /// Human-readable description of the violation.
        reason: String,
    },
}

impl ClientError {
    /// Convenience constructor for configuration failures.
    #[must_use]
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for transport failures.
    #[must_use]
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for expired deadlines.
    #[must_use]
    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::Timeout {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for protocol violations.
    #[must_use]
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    /// Returns the carried envelope when this is an in-band agent error.
    #[must_use]
    pub const fn envelope(&self) -> Option<&ErrorEnvelope> {
        match self {
            Self::Agent(envelope) => Some(envelope),
            _ => None,
        }
    }
}
