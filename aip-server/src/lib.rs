//! Agent-side runtime for the inter-agent invocation protocol.
//!
//! This crate provides the serving half of the protocol: capability card
//! publication, pre-flight negotiation, and synchronous and streamed
//! invocation with per-call budget enforcement, all exposed over HTTP/JSON
//! backed by `hyper`.

#![warn(missing_docs, clippy::pedantic)]

mod budget;
mod cancel;
mod http;
mod negotiate;
mod registry;
mod router;
mod stream;
mod traits;

pub use budget::{BudgetBreach, BudgetLedger};
pub use cancel::{CancelHandle, CancelSignal, cancel_pair};
pub use http::{AgentServer, ServerError, ServerResult, ShutdownHandle};
pub use negotiate::Negotiator;
pub use registry::{HandlerRegistry, RegistryError, RegistryResult};
pub use router::InvocationRouter;
pub use stream::{
    EventStream, StreamConfig, StreamPhase, StreamPhaseError, StreamPhaseResult, StreamingRouter,
};
pub use traits::{
    AuditEvent, AuditOutcome, AuditSink, BusinessHandler, ChunkStream, CollectingAuditSink,
    CostEstimator, HandlerChunk, HandlerError, HandlerOutput, HandlerResult, IdempotencyStore,
    StaticCostEstimator, TracingAuditSink,
};
