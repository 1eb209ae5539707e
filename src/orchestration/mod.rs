//! Orchestration layer.
//!
//! The `OrchestratorCore` is a deterministic state machine over the agent
//! registry and every project's task graph. The `Orchestrator` actor wraps
//! it, feeding it requests, worker reports and timer ticks from a single
//! queue. `Worker`s run tasks through capability providers and talk to the
//! orchestrator only over the message bus.

mod command;
mod core;
pub mod interfaces;
mod orchestrator;
mod planner;
mod registry;
mod worker;

pub use self::core::{OrchestratorCore, ProjectSnapshot};
pub use command::Command;
pub use interfaces::{
    validate_artifact_path, Artifact, ArtifactStore, CapabilityProvider, ChannelGateway,
    FailureKind, FailureNotice, Gateway, GatewayEvent, JsonProjectStore, MemoryArtifactStore,
    MemoryProjectStore, ProjectStore, ProviderError, ProviderOutput, StatusEvent, TaskEvent,
};
pub use orchestrator::Orchestrator;
pub use planner::{Plan, PlannedTask, Planner, StaticPlanner, TemplatePlanner};
pub use registry::AgentRegistry;
pub use worker::Worker;
