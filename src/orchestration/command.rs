//! Side effects produced by the orchestrator core.
//!
//! The core never performs I/O. Each operation queues `Command`s that the
//! orchestrator actor executes afterwards, in order.

use crate::agent::AgentId;
use crate::bus::Message;
use crate::project::ProjectRecord;

use super::interfaces::{FailureNotice, StatusEvent};

#[derive(Debug, Clone)]
pub enum Command {
    /// Send a message to one worker's inbox.
    Deliver { agent: AgentId, message: Message },
    /// Forward a status event to the gateway.
    Status(StatusEvent),
    /// Forward a failure notice to the gateway.
    Failure(FailureNotice),
    /// Persist the project record.
    Persist(ProjectRecord),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Deliver { .. } => "deliver",
            Command::Status(_) => "status",
            Command::Failure(_) => "failure",
            Command::Persist(_) => "persist",
        }
    }
}
