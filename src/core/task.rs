//! Task data model for the project task graph.
//!
//! Tasks are the atomic units of work assigned to agents. Each task
//! tracks its status, required capability, assignment, attempts and result.

use crate::agent::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a task within a project.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A capability tag such as `frontend`, `backend` or `review`.
///
/// Workers declare a set of these; a task names the one it needs.
/// Tags are compared case-insensitively by normalising to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    pub fn new(tag: &str) -> Self {
        Self(tag.trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Capability {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// Dispatch priority. `High` sorts first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Which project stage a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    #[default]
    Build,
    Review,
    Test,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Build => write!(f, "build"),
            TaskKind::Review => write!(f, "review"),
            TaskKind::Test => write!(f, "test"),
        }
    }
}

/// Task status in its lifecycle.
///
/// Tasks progress through these states as they are scheduled,
/// executed, and completed by agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Task created; dependencies may not be satisfied yet.
    #[default]
    Pending,
    /// Task dependencies satisfied, waiting for a capable idle agent.
    Ready,
    /// Task handed to an agent, not yet acknowledged.
    Assigned,
    /// Agent reported it is working on the task.
    Running,
    /// Task completed successfully.
    Completed,
    /// Task failed permanently.
    Failed {
        /// Error message describing the failure.
        error: String,
    },
    /// Task cannot proceed.
    Blocked {
        /// Reason why the task is blocked.
        reason: String,
    },
}

impl TaskStatus {
    /// Short name without the payload, used in transition errors.
    pub fn name(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::Blocked { .. } => "blocked",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// A problem reported by a review or test task.
///
/// Each finding becomes a remediation task when the project loops back
/// into building.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub description: String,
    /// Capability best suited to fix this; falls back to the configured
    /// remediation capability.
    #[serde(default)]
    pub capability: Option<Capability>,
}

impl Finding {
    pub fn new(description: &str) -> Self {
        Self {
            description: description.to_string(),
            capability: None,
        }
    }

    pub fn for_capability(description: &str, capability: Capability) -> Self {
        Self {
            description: description.to_string(),
            capability: Some(capability),
        }
    }
}

/// Success payload of a task.
///
/// Artifacts are referenced by path; content lives in the artifact store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub summary: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Non-empty on a failing review/test result.
    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl TaskResult {
    pub fn new(summary: &str) -> Self {
        Self {
            summary: summary.to_string(),
            ..Default::default()
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_findings(mut self, findings: Vec<Finding>) -> Self {
        self.findings = findings;
        self
    }

    pub fn passed(&self) -> bool {
        self.findings.is_empty()
    }
}

/// A single task in a project's task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Short human-readable name, unique within a plan.
    pub name: String,
    /// Detailed description of what the task should accomplish.
    pub description: String,
    /// Capability an agent needs to take this task.
    pub required_capability: Capability,
    pub priority: Priority,
    pub kind: TaskKind,
    /// Remediation round this task was created in (0 for the initial plan).
    pub round: u32,
    /// Current execution status.
    pub status: TaskStatus,
    /// ID of the agent assigned to this task.
    pub assigned_agent: Option<AgentId>,
    /// Number of failed attempts so far.
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub result: Option<TaskResult>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task was last handed to an agent.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new build task with Pending status and medium priority.
    pub fn new(name: &str, description: &str, capability: Capability) -> Self {
        Self {
            id: TaskId::new(),
            name: name.to_string(),
            description: description.to_string(),
            required_capability: capability,
            priority: Priority::default(),
            kind: TaskKind::default(),
            round: 0,
            status: TaskStatus::Pending,
            assigned_agent: None,
            attempt_count: 0,
            last_error: None,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_round(mut self, round: u32) -> Self {
        self.round = round;
        self
    }

    /// Check if the task is in a terminal state.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Blocked { .. }
        )
    }

    /// Check if the task is waiting for an agent (Pending or Ready).
    pub fn is_open(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Ready)
    }

    /// Check if the task is held by an agent.
    pub fn is_in_flight(&self) -> bool {
        matches!(self.status, TaskStatus::Assigned | TaskStatus::Running)
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}
