pub mod config;
pub mod constraints;
pub mod error;
pub mod types;

pub use error::{OrchestratorError, Result};
