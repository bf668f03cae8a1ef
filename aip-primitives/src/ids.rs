//! Correlation identifier type.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

const MAX_CORRELATION_LEN: usize = 128;

/// Caller-supplied token propagated across a call for tracing and idempotency.
///
/// Required on every invocation; the server echoes it into audit events and
/// the client attaches it as a header on every outbound request.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Creates a correlation identifier after validating its format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCorrelationId`] if the identifier is empty, too
    /// long, or contains characters outside the supported set.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidCorrelationId {
                id,
                reason: "identifier cannot be empty".into(),
            });
        }
        if id.len() > MAX_CORRELATION_LEN {
            return Err(Error::InvalidCorrelationId {
                id,
                reason: format!("identifier length must be <= {MAX_CORRELATION_LEN}"),
            });
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
        {
            return Err(Error::InvalidCorrelationId {
                id,
                reason: "identifier must contain alphanumeric, dash, underscore, dot, or colon"
                    .into(),
            });
        }
        Ok(Self(id))
    }

    /// Generates a random correlation identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CorrelationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl From<CorrelationId> for String {
    fn from(value: CorrelationId) -> Self {
        value.0
    }
}
