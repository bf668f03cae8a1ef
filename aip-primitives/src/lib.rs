//! Shared primitives for the AIP inter-agent invocation protocol.
//!
//! This crate defines the data that crosses the protocol boundary: capability
//! cards, invocation requests and results, stream events, negotiation types,
//! and the canonical error taxonomy. It contains no I/O; the server and client
//! crates build on top of it.

#![warn(missing_docs, clippy::pedantic)]

mod card;
mod error;
mod ids;
mod taxonomy;
mod wire;

pub use card::{AuthRequirement, CapabilityCard, CapabilityCardBuilder, CardLimits, PrivacyPolicy};
pub use error::{Error, Result};
pub use ids::CorrelationId;
pub use taxonomy::{ErrorEnvelope, ErrorKind, RetryClass};
pub use wire::{
    BUDGET_HEADER, CORRELATION_HEADER, InvocationRequest, InvocationResult, NegotiationOutcome,
    NegotiationRequest, NegotiationResult, PROTOCOL_VERSION, StreamEvent, Usage,
};
