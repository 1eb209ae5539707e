//! Messages exchanged over the bus.
//!
//! A `Message` is immutable once published: the bus hands each subscriber
//! its own clone.

use crate::agent::AgentId;
use crate::core::task::{Task, TaskId, TaskResult};
use crate::project::ProjectId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Topic the orchestrator listens on for worker reports.
pub const ORCHESTRATOR_TOPIC: &str = "orchestrator";

/// Topic carrying status events for observers.
pub const STATUS_TOPIC: &str = "status";

/// Sender name used by the orchestrator.
pub const ORCHESTRATOR_SENDER: &str = "orchestrator";

/// Ties an assignment to the reports answering it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    Notification,
    Error,
    Status,
}

/// Where a message is addressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "name")]
pub enum Recipient {
    Topic(String),
    Agent(AgentId),
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recipient::Topic(topic) => write!(f, "topic:{}", topic),
            Recipient::Agent(agent) => write!(f, "agent:{}", agent),
        }
    }
}

/// Typed message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Payload {
    /// Orchestrator hands a task to a worker.
    Assignment {
        project_id: ProjectId,
        task: Box<Task>,
        deadline: DateTime<Utc>,
    },
    /// Worker picked the assignment up.
    TaskStarted {
        project_id: ProjectId,
        task_id: TaskId,
        agent_id: AgentId,
    },
    /// Worker is parked on a long capability call.
    AgentWaiting {
        project_id: ProjectId,
        task_id: TaskId,
        agent_id: AgentId,
    },
    TaskCompleted {
        project_id: ProjectId,
        task_id: TaskId,
        agent_id: AgentId,
        result: TaskResult,
    },
    TaskFailed {
        project_id: ProjectId,
        task_id: TaskId,
        agent_id: AgentId,
        error: String,
    },
    Heartbeat {
        agent_id: AgentId,
    },
    /// Abandon work for the project, or only for one task of it.
    Cancel {
        project_id: ProjectId,
        #[serde(default)]
        task_id: Option<TaskId>,
    },
    Text {
        content: String,
    },
}

impl Payload {
    pub fn name(&self) -> &'static str {
        match self {
            Payload::Assignment { .. } => "assignment",
            Payload::TaskStarted { .. } => "task_started",
            Payload::AgentWaiting { .. } => "agent_waiting",
            Payload::TaskCompleted { .. } => "task_completed",
            Payload::TaskFailed { .. } => "task_failed",
            Payload::Heartbeat { .. } => "heartbeat",
            Payload::Cancel { .. } => "cancel",
            Payload::Text { .. } => "text",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender: String,
    pub recipient: Recipient,
    pub kind: MessageKind,
    pub correlation_id: Option<CorrelationId>,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(sender: &str, recipient: Recipient, kind: MessageKind, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.to_string(),
            recipient,
            kind,
            correlation_id: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn to_topic(sender: &str, topic: &str, kind: MessageKind, payload: Payload) -> Self {
        Self::new(sender, Recipient::Topic(topic.to_string()), kind, payload)
    }

    pub fn to_agent(sender: &str, agent: &AgentId, kind: MessageKind, payload: Payload) -> Self {
        Self::new(sender, Recipient::Agent(agent.clone()), kind, payload)
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Plain text notification, mostly useful for diagnostics and tests.
    pub fn text(sender: &str, topic: &str, content: &str) -> Self {
        Self::to_topic(
            sender,
            topic,
            MessageKind::Notification,
            Payload::Text {
                content: content.to_string(),
            },
        )
    }
}
