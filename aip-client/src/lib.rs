//! Caller-side runtime for the inter-agent invocation protocol.
//!
//! Discovers capability cards, negotiates scope and budget, and executes
//! synchronous and streamed invocations with bounded, taxonomy-aware retry.

#![warn(missing_docs, clippy::pedantic)]

mod client;
mod error;
mod http_client;
mod sse;

pub use client::{ClientConfig, EventStream, ProtocolClient, RetryPolicy};
pub use error::{ClientError, ClientResult};
