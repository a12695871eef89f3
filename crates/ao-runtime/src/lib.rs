//! Execution backends. Every backend implements [`adapter::RuntimeAdapter`]
//! so the router can treat in-process handlers, remote endpoints, containers
//! and subprocesses the same way.

pub mod adapter;
pub mod container;
pub mod http;
pub mod in_process;
pub mod process;
pub mod wire;

pub use adapter::{AdapterSet, HandleTarget, InstanceHandle, RuntimeAdapter, RuntimeError, StartSpec};
pub use in_process::{AgentHandler, EchoAgent, HandlerRegistry};
