//! Observability for the orchestrator: `tracing` subscriber setup, an
//! in-process metrics collector with Prometheus export, and axum middleware
//! for request ids and API metrics.

pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod tracing_setup;
