pub mod agent;
pub mod bus;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod project;
pub mod util;

// Background actors
pub mod actors;

pub use error::{Error, Result};
pub use orchestration::{Orchestrator, OrchestratorCore, Worker};
pub use project::{ProjectId, ProjectRequest, Stage};
