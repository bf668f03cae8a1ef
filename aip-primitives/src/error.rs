//! Shared error definitions for protocol primitives.

use thiserror::Error;

/// Result alias used throughout the primitives crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while constructing or validating protocol primitives.
#[derive(Debug, Error)]
pub enum Error {
    /// Correlation identifier failed validation.
    #[error("invalid correlation id `{id}`: {reason}")]
    InvalidCorrelationId {
        /// The offending identifier string.
        id: String,
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// Capability card failed schema validation.
    #[error("invalid capability card: {reason}")]
    InvalidCard {
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// Capability card document could not be decoded.
    #[error("malformed capability card document: {source}")]
    MalformedCard {
        /// Underlying JSON decode error.
        #[from]
        source: serde_json::Error,
    },

    /// Invocation request failed validation.
    #[error("invalid invocation request: {reason}")]
    InvalidRequest {
        /// Human-readable reason for rejection.
        reason: String,
    },
}

impl Error {
    /// Convenience constructor for card validation failures.
    #[must_use]
    pub fn invalid_card(reason: impl Into<String>) -> Self {
        Self::InvalidCard {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for request validation failures.
    #[must_use]
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }
}
