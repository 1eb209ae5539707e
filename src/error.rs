use thiserror::Error;

use crate::agent::AgentId;
use crate::core::task::{Capability, TaskId};
use crate::project::ProjectId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Adding task {task} would create a dependency cycle")]
    DependencyCycle { task: String },

    #[error("No registered agent provides capability '{capability}' for task {task}")]
    CapabilityMismatch { task: TaskId, capability: Capability },

    #[error("Task {task} failed on attempt {attempt}: {error}")]
    TransientWorker {
        task: TaskId,
        attempt: u32,
        error: String,
    },

    #[error("Task {task} failed permanently after {attempts} attempts: {error}")]
    FatalTask {
        task: TaskId,
        attempts: u32,
        error: String,
    },

    #[error("Delivery on topic '{topic}' failed: {error}")]
    BusDelivery { topic: String, error: String },

    #[error("Topic '{topic}' queue is full")]
    TopicFull { topic: String },

    #[error("Inbox for agent {agent} is full")]
    InboxFull { agent: AgentId },

    #[error("No inbox registered for agent {agent}")]
    UnknownRecipient { agent: AgentId },

    #[error("Message bus is shut down")]
    BusClosed,

    #[error("Task not found: {id}")]
    TaskNotFound { id: TaskId },

    #[error("Agent not found: {id}")]
    AgentNotFound { id: AgentId },

    #[error("Agent already registered: {id}")]
    AgentExists { id: AgentId },

    #[error("Project not found: {id}")]
    ProjectNotFound { id: ProjectId },

    #[error("Invalid task transition for {task} from {from} to {to}")]
    InvalidTaskTransition {
        task: TaskId,
        from: String,
        to: String,
    },

    #[error("Invalid agent transition for {agent} from {from} to {to}")]
    InvalidAgentTransition {
        agent: AgentId,
        from: String,
        to: String,
    },

    #[error("Invalid stage transition from {from} to {to}")]
    InvalidStageTransition { from: String, to: String },

    #[error("Orchestrator is not running")]
    OrchestratorStopped,
}

pub type Result<T> = std::result::Result<T, Error>;
