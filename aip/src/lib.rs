//! Inter-agent invocation protocol SDK facade.
//!
//! Depend on this crate via `cargo add aip`. It bundles the protocol crates
//! behind feature flags so agents can pull in only the half they need.

#![warn(missing_docs, clippy::pedantic)]

/// Re-export shared wire types and the capability card for convenience.
pub use aip_primitives as primitives;

/// Agent-side runtime: card publication, negotiation, invocation serving
/// (enabled by the `server` feature).
#[cfg(feature = "server")]
pub use aip_server as server;

/// Caller-side runtime: discovery, negotiation, retrying invocation
/// (enabled by the `client` feature).
#[cfg(feature = "client")]
pub use aip_client as client;

/// Process-wide logging setup (enabled by the `telemetry` feature).
#[cfg(feature = "telemetry")]
pub mod telemetry {
    use tracing_subscriber::EnvFilter;

    /// Installs a formatted tracing subscriber filtered by `RUST_LOG`.
    ///
    /// Falls back to `info` when the variable is unset. Calling this twice
    /// is a no-op; the second call leaves the first subscriber in place.
    pub fn init() {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    }
}
