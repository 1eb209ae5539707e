//! Worker agent records and their lifecycle state machine.
//!
//! The registry owns one `AgentRecord` per worker. Only the orchestrator
//! calls the transition methods; workers request changes over the bus.

use crate::core::task::{Capability, TaskId};
use crate::error::{Error, Result};
use crate::project::ProjectId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::time::Instant;

/// Name of a worker agent, unique within a registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Free to take an assignment.
    #[default]
    Idle,
    /// Working on exactly one task.
    Busy,
    /// Working, but parked on a long external call. Occupied like `Busy`.
    Waiting,
    /// Reported a failure the orchestrator has not processed yet.
    Error,
    /// Missed its heartbeat deadline.
    Offline,
}

impl AgentState {
    pub fn name(&self) -> &'static str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Busy => "busy",
            AgentState::Waiting => "waiting",
            AgentState::Error => "error",
            AgentState::Offline => "offline",
        }
    }

    /// Busy and waiting both hold a task.
    pub fn is_occupied(&self) -> bool {
        matches!(self, AgentState::Busy | AgentState::Waiting)
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Registry entry for one worker.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub id: AgentId,
    pub capabilities: BTreeSet<Capability>,
    state: AgentState,
    current_task: Option<(ProjectId, TaskId)>,
    pub last_heartbeat: Instant,
    pub last_error: Option<String>,
}

impl AgentRecord {
    pub fn new(id: AgentId, capabilities: impl IntoIterator<Item = Capability>, now: Instant) -> Self {
        Self {
            id,
            capabilities: capabilities.into_iter().collect(),
            state: AgentState::Idle,
            current_task: None,
            last_heartbeat: now,
            last_error: None,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn current_task(&self) -> Option<(ProjectId, TaskId)> {
        self.current_task
    }

    pub fn has_capability(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn is_idle(&self) -> bool {
        self.state == AgentState::Idle
    }

    fn invalid(&self, to: AgentState) -> Error {
        Error::InvalidAgentTransition {
            agent: self.id.clone(),
            from: self.state.name().to_string(),
            to: to.name().to_string(),
        }
    }

    /// idle -> busy. An agent never holds two tasks.
    pub fn assign(&mut self, project: ProjectId, task: TaskId) -> Result<()> {
        if self.state != AgentState::Idle {
            return Err(self.invalid(AgentState::Busy));
        }
        self.state = AgentState::Busy;
        self.current_task = Some((project, task));
        Ok(())
    }

    /// busy -> waiting
    pub fn begin_waiting(&mut self) -> Result<()> {
        match self.state {
            AgentState::Busy | AgentState::Waiting => {
                self.state = AgentState::Waiting;
                Ok(())
            }
            _ => Err(self.invalid(AgentState::Waiting)),
        }
    }

    /// waiting -> busy
    pub fn resume(&mut self) -> Result<()> {
        match self.state {
            AgentState::Waiting | AgentState::Busy => {
                self.state = AgentState::Busy;
                Ok(())
            }
            _ => Err(self.invalid(AgentState::Busy)),
        }
    }

    /// busy -> idle on successful completion.
    pub fn complete(&mut self) -> Result<()> {
        if !self.state.is_occupied() {
            return Err(self.invalid(AgentState::Idle));
        }
        self.state = AgentState::Idle;
        self.current_task = None;
        Ok(())
    }

    /// busy -> error on a failure report.
    pub fn fail(&mut self, error: &str) -> Result<()> {
        if !self.state.is_occupied() {
            return Err(self.invalid(AgentState::Error));
        }
        self.state = AgentState::Error;
        self.current_task = None;
        self.last_error = Some(error.to_string());
        Ok(())
    }

    /// error -> idle once the orchestrator has processed the failure.
    pub fn acknowledge_failure(&mut self) -> Result<()> {
        if self.state != AgentState::Error {
            return Err(self.invalid(AgentState::Idle));
        }
        self.state = AgentState::Idle;
        Ok(())
    }

    /// Drop the held task and return to idle, used on cancellation.
    ///
    /// An offline agent stays offline; it comes back through `heartbeat`.
    pub fn release(&mut self) {
        self.current_task = None;
        if self.state != AgentState::Offline {
            self.state = AgentState::Idle;
        }
    }

    /// any -> offline. Returns the task the agent was holding, if any.
    pub fn mark_offline(&mut self) -> Option<(ProjectId, TaskId)> {
        self.state = AgentState::Offline;
        self.current_task.take()
    }

    /// Record a heartbeat. Returns true if the agent came back from offline.
    pub fn heartbeat(&mut self, now: Instant) -> bool {
        self.last_heartbeat = now;
        if self.state == AgentState::Offline {
            self.state = AgentState::Idle;
            return true;
        }
        false
    }
}

/// Serializable view of an agent for status events and snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_id: AgentId,
    pub state: AgentState,
    pub capabilities: Vec<Capability>,
    pub current_task: Option<TaskId>,
}

impl From<&AgentRecord> for AgentStatus {
    fn from(record: &AgentRecord) -> Self {
        Self {
            agent_id: record.id.clone(),
            state: record.state,
            capabilities: record.capabilities.iter().cloned().collect(),
            current_task: record.current_task.map(|(_, task)| task),
        }
    }
}
