//! Reliability infrastructure for the agent orchestrator: the per-instance
//! circuit breaker, cooperative shutdown, and cancellable periodic loops.

pub mod circuit_breaker;
pub mod periodic;
pub mod shutdown;
