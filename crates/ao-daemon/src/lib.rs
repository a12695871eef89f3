//! Daemon hosting the orchestrator: background loops, the HTTP/JSON API and
//! start-up bootstrap of configured agents.

pub mod api_error;
pub mod daemon;
pub mod http_api;

pub use daemon::Daemon;
