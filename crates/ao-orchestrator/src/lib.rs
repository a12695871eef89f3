pub mod autoscaler;
pub mod balancer;
pub mod events;
pub mod health;
pub mod instance;
pub mod orchestrator;
pub mod registry;
pub mod router;

pub use orchestrator::Orchestrator;
pub use registry::DeploySpec;
