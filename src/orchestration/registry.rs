//! Agent registry: capability sets and lifecycle state for every worker.
//!
//! The orchestrator owns the only `AgentRegistry` and is its only writer.
//! Agents are kept in registration order so that matching a task to an
//! idle worker is deterministic.

use crate::agent::{AgentId, AgentRecord, AgentState, AgentStatus};
use crate::core::task::{Capability, TaskId};
use crate::error::{Error, Result};
use crate::project::ProjectId;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: HashMap<AgentId, AgentRecord>,
    /// Registration order, used for deterministic matching.
    order: Vec<AgentId>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker in state idle.
    ///
    /// # Errors
    ///
    /// Returns `AgentExists` if the id is already registered.
    pub fn register(
        &mut self,
        id: AgentId,
        capabilities: impl IntoIterator<Item = Capability>,
        now: Instant,
    ) -> Result<()> {
        if self.agents.contains_key(&id) {
            return Err(Error::AgentExists { id });
        }
        let record = AgentRecord::new(id.clone(), capabilities, now);
        info!(
            "Registered agent {} with capabilities [{}]",
            id,
            record
                .capabilities
                .iter()
                .map(Capability::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.order.push(id.clone());
        self.agents.insert(id, record);
        Ok(())
    }

    /// Remove a worker, returning its final record.
    pub fn unregister(&mut self, id: &AgentId) -> Result<AgentRecord> {
        let record = self
            .agents
            .remove(id)
            .ok_or_else(|| Error::AgentNotFound { id: id.clone() })?;
        self.order.retain(|a| a != id);
        info!("Unregistered agent {}", id);
        Ok(record)
    }

    pub fn get(&self, id: &AgentId) -> Option<&AgentRecord> {
        self.agents.get(id)
    }

    pub fn get_mut(&mut self, id: &AgentId) -> Result<&mut AgentRecord> {
        self.agents
            .get_mut(id)
            .ok_or_else(|| Error::AgentNotFound { id: id.clone() })
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.agents.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Agents in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &AgentRecord> {
        self.order.iter().filter_map(|id| self.agents.get(id))
    }

    /// First idle agent, in registration order, that has `capability`.
    pub fn find_idle(&self, capability: &Capability) -> Option<AgentId> {
        self.iter()
            .find(|a| a.is_idle() && a.has_capability(capability))
            .map(|a| a.id.clone())
    }

    /// Whether any agent that is not offline could ever take `capability`.
    pub fn has_capable(&self, capability: &Capability) -> bool {
        self.iter()
            .any(|a| a.state() != AgentState::Offline && a.has_capability(capability))
    }

    pub fn agents_with_capability(&self, capability: &Capability) -> Vec<&AgentRecord> {
        self.iter().filter(|a| a.has_capability(capability)).collect()
    }

    /// Union of every registered agent's capabilities.
    pub fn all_capabilities(&self) -> BTreeSet<Capability> {
        self.agents
            .values()
            .flat_map(|a| a.capabilities.iter().cloned())
            .collect()
    }

    pub fn add_capability(&mut self, id: &AgentId, capability: Capability) -> Result<()> {
        let agent = self.get_mut(id)?;
        debug!("Agent {} gained capability {}", id, capability);
        agent.capabilities.insert(capability);
        Ok(())
    }

    /// Returns false if the agent did not have the capability.
    pub fn remove_capability(&mut self, id: &AgentId, capability: &Capability) -> Result<bool> {
        Ok(self.get_mut(id)?.capabilities.remove(capability))
    }

    /// Record a heartbeat. Returns true if the agent came back from offline.
    pub fn heartbeat(&mut self, id: &AgentId, now: Instant) -> Result<bool> {
        let recovered = self.get_mut(id)?.heartbeat(now);
        if recovered {
            info!("Agent {} is back online", id);
        }
        Ok(recovered)
    }

    /// Whether the agent has been heard from within `timeout`.
    pub fn is_healthy(&self, id: &AgentId, now: Instant, timeout: Duration) -> bool {
        self.agents.get(id).is_some_and(|a| {
            a.state() != AgentState::Offline
                && now.saturating_duration_since(a.last_heartbeat) <= timeout
        })
    }

    /// Move every agent that missed its heartbeat deadline to offline.
    ///
    /// Returns the agents that went offline, each with the task it was
    /// holding at the time.
    pub fn check_heartbeats(
        &mut self,
        now: Instant,
        timeout: Duration,
    ) -> Vec<(AgentId, Option<(ProjectId, TaskId)>)> {
        let mut lost = Vec::new();
        for id in &self.order {
            let Some(agent) = self.agents.get_mut(id) else {
                continue;
            };
            if agent.state() == AgentState::Offline {
                continue;
            }
            let silent = now.saturating_duration_since(agent.last_heartbeat);
            if silent > timeout {
                warn!("Agent {} missed heartbeat ({:?} silent), marking offline", id, silent);
                let held = agent.mark_offline();
                lost.push((id.clone(), held));
            }
        }
        lost
    }

    pub fn idle_count(&self) -> usize {
        self.agents.values().filter(|a| a.is_idle()).count()
    }

    /// Serializable statuses in registration order.
    pub fn statuses(&self) -> Vec<AgentStatus> {
        self.iter().map(AgentStatus::from).collect()
    }
}
