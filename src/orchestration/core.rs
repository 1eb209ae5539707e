//! Synchronous orchestration state machine.
//!
//! `OrchestratorCore` owns the agent registry and every project's stage and
//! task graph. It is deterministic: callers pass the current time, and every
//! operation queues side effects as `Command`s instead of performing I/O.
//! The orchestrator actor feeds it bus messages and timer ticks one at a
//! time, which serialises all event processing.
//!
//! Worker reports are matched to assignments by correlation id. Once a
//! report has been applied its correlation id is forgotten, so duplicates
//! and reports for cancelled or timed-out assignments are ignored.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::agent::{AgentId, AgentStatus};
use crate::bus::{CorrelationId, Message, MessageKind, Payload, ORCHESTRATOR_SENDER};
use crate::config::Config;
use crate::core::dag::TaskGraph;
use crate::core::task::{
    Capability, Finding, Priority, Task, TaskId, TaskKind, TaskResult, TaskStatus,
};
use crate::error::{Error, Result};
use crate::project::{ProjectId, ProjectRecord, ProjectRequest, ProjectState, Stage, StageHistoryEntry};

use super::command::Command;
use super::interfaces::{FailureKind, FailureNotice, StatusEvent, TaskEvent};
use super::planner::{Plan, Planner};
use super::registry::AgentRegistry;

/// Point-in-time view of one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub record: ProjectRecord,
    pub stage_history: Vec<StageHistoryEntry>,
    pub remediation_loops: u32,
    pub tasks: Vec<Task>,
    pub agents: Vec<AgentStatus>,
}

/// An assignment awaiting its report.
#[derive(Debug, Clone)]
struct Inflight {
    project_id: ProjectId,
    task_id: TaskId,
    agent_id: AgentId,
    deadline: Instant,
}

struct Project {
    state: ProjectState,
    graph: TaskGraph,
    /// When a ready task was first seen with no capable agent registered.
    unmatched_since: HashMap<TaskId, Instant>,
    /// First fatal failure, reported when the project blocks.
    failure: Option<FailureNotice>,
    task_events: Vec<TaskEvent>,
    dirty: bool,
    notified: bool,
}

impl Project {
    fn new(record: ProjectRecord) -> Self {
        Self {
            state: ProjectState::new(record),
            graph: TaskGraph::new(),
            unmatched_since: HashMap::new(),
            failure: None,
            task_events: Vec::new(),
            dirty: true,
            notified: false,
        }
    }

    fn is_dispatching(&self) -> bool {
        matches!(
            self.state.stage(),
            Stage::Building | Stage::Review | Stage::Testing
        )
    }

    fn record_task(&mut self, id: &TaskId) {
        if let Some(task) = self.graph.get_task(id) {
            self.task_events.push(TaskEvent::from(task));
            self.dirty = true;
        }
    }

    /// Notice describing the first failed task, if no explicit one was kept.
    fn fallback_notice(&self, project_id: ProjectId) -> FailureNotice {
        let failed = self
            .graph
            .all_tasks()
            .into_iter()
            .find(|t| matches!(t.status, TaskStatus::Failed { .. }));
        match failed {
            Some(task) => FailureNotice {
                project_id,
                kind: FailureKind::FatalTask,
                task_id: Some(task.id),
                attempts: task.attempt_count,
                last_error: task.last_error.clone().unwrap_or_default(),
            },
            None => FailureNotice {
                project_id,
                kind: FailureKind::FatalTask,
                task_id: None,
                attempts: 0,
                last_error: "no further progress is possible".to_string(),
            },
        }
    }
}

pub struct OrchestratorCore {
    config: Config,
    planner: Box<dyn Planner>,
    registry: AgentRegistry,
    projects: HashMap<ProjectId, Project>,
    /// Project ids in arrival order, for deterministic scheduling passes.
    order: Vec<ProjectId>,
    inflight: HashMap<CorrelationId, Inflight>,
    effects: Vec<Command>,
}

impl OrchestratorCore {
    pub fn new(config: Config, planner: Box<dyn Planner>) -> Self {
        Self {
            config,
            planner,
            registry: AgentRegistry::new(),
            projects: HashMap::new(),
            order: Vec::new(),
            inflight: HashMap::new(),
            effects: Vec::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Drain the side effects queued so far.
    pub fn take_effects(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.effects)
    }

    pub fn stage(&self, id: &ProjectId) -> Option<Stage> {
        self.projects.get(id).map(|p| p.state.stage())
    }

    pub fn graph(&self, id: &ProjectId) -> Option<&TaskGraph> {
        self.projects.get(id).map(|p| &p.graph)
    }

    pub fn project_ids(&self) -> Vec<ProjectId> {
        self.order.clone()
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    fn project_mut(&mut self, id: ProjectId) -> Result<&mut Project> {
        self.projects
            .get_mut(&id)
            .ok_or(Error::ProjectNotFound { id })
    }

    // ========== Agents ==========

    pub fn register_agent(
        &mut self,
        id: AgentId,
        capabilities: Vec<Capability>,
        now: Instant,
    ) -> Result<()> {
        self.registry.register(id, capabilities, now)?;
        self.touch_active();
        self.schedule(now);
        self.flush();
        Ok(())
    }

    /// Remove an agent. A task it was holding counts as a failed attempt.
    pub fn unregister_agent(&mut self, id: &AgentId, now: Instant) -> Result<()> {
        if !self.registry.contains(id) {
            return Err(Error::AgentNotFound { id: id.clone() });
        }
        if let Some(correlation) = self.correlation_for_agent(id) {
            self.fail_assignment(correlation, format!("agent {} unregistered", id), now);
        }
        self.registry.unregister(id)?;
        self.touch_active();
        self.schedule(now);
        self.flush();
        Ok(())
    }

    pub fn agent_statuses(&self) -> Vec<AgentStatus> {
        self.registry.statuses()
    }

    fn correlation_for_agent(&self, agent: &AgentId) -> Option<CorrelationId> {
        self.inflight
            .iter()
            .find(|(_, f)| &f.agent_id == agent)
            .map(|(c, _)| *c)
    }

    /// Mark every non-terminal project as changed, for agent-only updates.
    fn touch_active(&mut self) {
        for project in self.projects.values_mut() {
            if !project.state.is_terminal() {
                project.dirty = true;
            }
        }
    }

    // ========== Requests ==========

    /// Validate a request, plan it, and start building.
    ///
    /// # Errors
    ///
    /// - `Validation` for an empty or oversized request, a duplicate project
    ///   id, or an unusable plan
    /// - `DependencyCycle` if the plan's dependencies form a cycle; the
    ///   project is recorded as blocked and one failure notice is emitted
    pub fn handle_request(&mut self, request: ProjectRequest, now: Instant) -> Result<ProjectId> {
        let text = request.request_text.trim();
        if text.is_empty() {
            return Err(Error::Validation("request text is empty".to_string()));
        }
        let max = self.config.max_request_len;
        if text.chars().count() > max {
            return Err(Error::Validation(format!(
                "request exceeds {} characters",
                max
            )));
        }
        let id = request.project_id.unwrap_or_default();
        if self.projects.contains_key(&id) {
            return Err(Error::Validation(format!("project {} already exists", id)));
        }

        let record = ProjectRecord::new(id, text);
        info!("Project {} received: '{}'", id.short(), record.name);
        self.effects.push(Command::Persist(record.clone()));
        self.projects.insert(id, Project::new(record));
        self.order.push(id);

        self.transition(id, Stage::Planning)?;
        let planned = self.planner.plan(text).and_then(Plan::into_batch);
        let project = self.project_mut(id)?;
        match planned.and_then(|batch| project.graph.add_batch(batch)) {
            Ok(ids) => {
                info!("Project {} planned with {} task(s)", id.short(), ids.len());
                for task_id in &ids {
                    project.record_task(task_id);
                }
                self.transition(id, Stage::Building)?;
                self.promote(id);
                self.schedule(now);
                self.flush();
                Ok(id)
            }
            Err(e) => {
                error!("Planning failed for project {}: {}", id.short(), e);
                // Only a cycle is reported to the gateway; any other plan
                // error goes back to the caller alone.
                if !matches!(e, Error::DependencyCycle { .. }) {
                    project.notified = true;
                }
                self.block(
                    id,
                    FailureNotice {
                        project_id: id,
                        kind: FailureKind::DependencyCycle,
                        task_id: None,
                        attempts: 0,
                        last_error: e.to_string(),
                    },
                );
                self.flush();
                Err(e)
            }
        }
    }

    /// Cancel a project: block every open task and free its agents.
    pub fn cancel(&mut self, id: ProjectId, now: Instant) -> Result<()> {
        let project = self.project_mut(id)?;
        if project.state.is_terminal() {
            debug!("Cancel for terminal project {} ignored", id.short());
            return Ok(());
        }

        let blocked = project.graph.block_open("cancelled");
        for (task_id, _) in &blocked {
            project.record_task(task_id);
        }
        project.unmatched_since.clear();
        self.inflight.retain(|_, f| f.project_id != id);

        for (task_id, agent) in blocked {
            let Some(agent) = agent else { continue };
            if let Ok(record) = self.registry.get_mut(&agent) {
                if record.current_task() == Some((id, task_id)) {
                    record.release();
                }
            }
            self.effects.push(Command::Deliver {
                message: Message::to_agent(
                    ORCHESTRATOR_SENDER,
                    &agent,
                    MessageKind::Request,
                    Payload::Cancel {
                        project_id: id,
                        task_id: None,
                    },
                ),
                agent,
            });
        }

        info!("Project {} cancelled", id.short());
        self.block(
            id,
            FailureNotice {
                project_id: id,
                kind: FailureKind::Cancelled,
                task_id: None,
                attempts: 0,
                last_error: "cancelled by request".to_string(),
            },
        );
        self.schedule(now);
        self.flush();
        Ok(())
    }

    pub fn snapshot(&self, id: ProjectId) -> Result<ProjectSnapshot> {
        let project = self
            .projects
            .get(&id)
            .ok_or(Error::ProjectNotFound { id })?;
        Ok(ProjectSnapshot {
            record: project.state.record().clone(),
            stage_history: project.state.stage_history().to_vec(),
            remediation_loops: project.state.remediation_loops(),
            tasks: project.graph.all_tasks().into_iter().cloned().collect(),
            agents: self.registry.statuses(),
        })
    }

    /// Drop a finished project's graph, returning its final record.
    pub fn archive(&mut self, id: ProjectId) -> Result<ProjectRecord> {
        let project = self
            .projects
            .get(&id)
            .ok_or(Error::ProjectNotFound { id })?;
        if !project.state.is_terminal() {
            return Err(Error::Validation(format!(
                "project {} is still {}",
                id.short(),
                project.state.stage()
            )));
        }
        let project = self
            .projects
            .remove(&id)
            .ok_or(Error::ProjectNotFound { id })?;
        self.order.retain(|p| *p != id);
        info!("Archived project {}", id.short());
        Ok(project.state.record().clone())
    }

    // ========== Bus events ==========

    /// Apply one worker report from the bus.
    pub fn handle_message(&mut self, message: Message, now: Instant) {
        trace!("Orchestrator received {} from {}", message.payload.name(), message.sender);
        let correlation = message.correlation_id;
        match message.payload {
            Payload::Heartbeat { agent_id } => self.on_heartbeat(&agent_id, now),
            Payload::TaskStarted {
                project_id,
                task_id,
                agent_id,
            } => self.on_started(correlation, project_id, task_id, &agent_id, false),
            Payload::AgentWaiting {
                project_id,
                task_id,
                agent_id,
            } => self.on_started(correlation, project_id, task_id, &agent_id, true),
            Payload::TaskCompleted {
                project_id,
                task_id,
                agent_id,
                result,
            } => self.on_completed(correlation, project_id, task_id, &agent_id, result, now),
            Payload::TaskFailed {
                project_id,
                task_id,
                agent_id,
                error,
            } => self.on_failed(correlation, project_id, task_id, &agent_id, error, now),
            other => debug!(
                "Ignoring {} message from {}",
                other.name(),
                message.sender
            ),
        }
        self.flush();
    }

    /// An assignment could not be delivered to its worker.
    pub fn delivery_failed(&mut self, correlation: CorrelationId, error: &str, now: Instant) {
        self.fail_assignment(correlation, format!("delivery failed: {}", error), now);
        self.flush();
    }

    /// Timer pass: heartbeat sweep, assignment deadlines, scheduling.
    pub fn tick(&mut self, now: Instant) {
        let lost = self
            .registry
            .check_heartbeats(now, self.config.heartbeat_timeout());
        if !lost.is_empty() {
            self.touch_active();
        }
        for (agent, held) in lost {
            if held.is_none() {
                continue;
            }
            if let Some(correlation) = self.correlation_for_agent(&agent) {
                self.fail_assignment(correlation, format!("agent {} missed heartbeat", agent), now);
            }
        }

        let mut expired: Vec<(Instant, CorrelationId)> = self
            .inflight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(c, f)| (f.deadline, *c))
            .collect();
        expired.sort_by_key(|(deadline, _)| *deadline);
        for (_, correlation) in expired {
            let Some(flight) = self.inflight.get(&correlation).cloned() else {
                continue;
            };
            warn!(
                "Assignment of task {} to {} passed its deadline",
                flight.task_id.short(),
                flight.agent_id
            );
            self.effects.push(Command::Deliver {
                message: Message::to_agent(
                    ORCHESTRATOR_SENDER,
                    &flight.agent_id,
                    MessageKind::Request,
                    Payload::Cancel {
                        project_id: flight.project_id,
                        task_id: Some(flight.task_id),
                    },
                )
                .with_correlation(correlation),
                agent: flight.agent_id.clone(),
            });
            self.fail_assignment(
                correlation,
                format!(
                    "assignment deadline of {}s exceeded",
                    self.config.assignment_timeout_secs
                ),
                now,
            );
        }

        self.schedule(now);
        self.flush();
    }

    fn on_heartbeat(&mut self, agent: &AgentId, now: Instant) {
        match self.registry.heartbeat(agent, now) {
            Ok(true) => {
                self.touch_active();
                self.schedule(now);
            }
            Ok(false) => {}
            Err(_) => debug!("Heartbeat from unknown agent {}", agent),
        }
    }

    /// Whether a report matches a live assignment.
    fn is_current(
        &self,
        correlation: Option<CorrelationId>,
        project_id: ProjectId,
        task_id: TaskId,
        agent: &AgentId,
    ) -> Option<CorrelationId> {
        let Some(correlation) = correlation else {
            debug!("Ignoring report without correlation id from {}", agent);
            return None;
        };
        match self.inflight.get(&correlation) {
            Some(f) if f.project_id == project_id && f.task_id == task_id && &f.agent_id == agent => {
                Some(correlation)
            }
            Some(_) => {
                warn!(
                    "Report {} from {} does not match its assignment",
                    correlation.short(),
                    agent
                );
                None
            }
            None => {
                debug!(
                    "Ignoring stale or duplicate report {} from {}",
                    correlation.short(),
                    agent
                );
                None
            }
        }
    }

    fn on_started(
        &mut self,
        correlation: Option<CorrelationId>,
        project_id: ProjectId,
        task_id: TaskId,
        agent: &AgentId,
        waiting: bool,
    ) {
        if self.is_current(correlation, project_id, task_id, agent).is_none() {
            return;
        }
        if let Ok(record) = self.registry.get_mut(agent) {
            let moved = if waiting {
                record.begin_waiting()
            } else {
                record.resume()
            };
            if let Err(e) = moved {
                debug!("{}", e);
            }
        }
        if let Some(project) = self.projects.get_mut(&project_id) {
            if !waiting {
                if let Err(e) = project.graph.mark_running(&task_id) {
                    debug!("{}", e);
                }
            }
            project.record_task(&task_id);
        }
    }

    fn on_completed(
        &mut self,
        correlation: Option<CorrelationId>,
        project_id: ProjectId,
        task_id: TaskId,
        agent: &AgentId,
        result: TaskResult,
        now: Instant,
    ) {
        let Some(correlation) = self.is_current(correlation, project_id, task_id, agent) else {
            return;
        };
        self.inflight.remove(&correlation);

        if let Ok(record) = self.registry.get_mut(agent) {
            if let Err(e) = record.complete() {
                debug!("{}", e);
            }
        }

        let Some(project) = self.projects.get_mut(&project_id) else {
            return;
        };
        match project.graph.mark_completed(&task_id, result) {
            Ok(unlocked) => {
                info!("Task {} completed by {}", task_id.short(), agent);
                project.record_task(&task_id);
                for id in &unlocked {
                    project.record_task(id);
                }
            }
            Err(e) => debug!("Completion not applied: {}", e),
        }

        self.advance(project_id, now);
        // A task that failed earlier may have been waiting only on this one.
        self.check_blocked(project_id);
        self.schedule(now);
    }

    fn on_failed(
        &mut self,
        correlation: Option<CorrelationId>,
        project_id: ProjectId,
        task_id: TaskId,
        agent: &AgentId,
        error: String,
        now: Instant,
    ) {
        if let Some(correlation) = self.is_current(correlation, project_id, task_id, agent) {
            self.fail_assignment(correlation, error, now);
        }
    }

    /// Count a failed attempt: retry within budget, otherwise fail the task.
    fn fail_assignment(&mut self, correlation: CorrelationId, error: String, now: Instant) {
        let Some(flight) = self.inflight.remove(&correlation) else {
            return;
        };
        let max_retries = self.config.max_retries;

        // busy -> error; acknowledged below once the failure is processed.
        let in_error = match self.registry.get_mut(&flight.agent_id) {
            Ok(record) => record.fail(&error).is_ok(),
            Err(_) => false,
        };

        if let Some(project) = self.projects.get_mut(&flight.project_id) {
            match project.graph.record_attempt(&flight.task_id, &error) {
                Ok(attempts) if attempts < max_retries => {
                    warn!(
                        "{}",
                        Error::TransientWorker {
                            task: flight.task_id,
                            attempt: attempts,
                            error: error.clone(),
                        }
                    );
                    if let Err(e) = project.graph.requeue(&flight.task_id) {
                        debug!("{}", e);
                    }
                    project.record_task(&flight.task_id);
                }
                Ok(attempts) => {
                    error!(
                        "{}",
                        Error::FatalTask {
                            task: flight.task_id,
                            attempts,
                            error: error.clone(),
                        }
                    );
                    match project.graph.mark_failed(&flight.task_id, &error) {
                        Ok(blocked) => {
                            project.record_task(&flight.task_id);
                            for id in &blocked {
                                project.record_task(id);
                            }
                        }
                        Err(e) => debug!("{}", e),
                    }
                    project.failure.get_or_insert(FailureNotice {
                        project_id: flight.project_id,
                        kind: FailureKind::FatalTask,
                        task_id: Some(flight.task_id),
                        attempts,
                        last_error: error.clone(),
                    });
                }
                Err(e) => debug!("{}", e),
            }
        }

        if in_error {
            if let Ok(record) = self.registry.get_mut(&flight.agent_id) {
                let _ = record.acknowledge_failure();
            }
        }

        self.check_blocked(flight.project_id);
        self.schedule(now);
    }

    // ========== Scheduling ==========

    fn promote(&mut self, id: ProjectId) {
        if let Some(project) = self.projects.get_mut(&id) {
            for task_id in project.graph.promote_ready() {
                project.record_task(&task_id);
            }
        }
    }

    /// One scheduling pass over every active project, in arrival order.
    fn schedule(&mut self, now: Instant) {
        let active: Vec<ProjectId> = self
            .order
            .iter()
            .copied()
            .filter(|id| self.projects.get(id).is_some_and(Project::is_dispatching))
            .collect();
        for id in active {
            self.dispatch_project(id, now);
            self.check_blocked(id);
        }
    }

    fn dispatch_project(&mut self, id: ProjectId, now: Instant) {
        let timeout = self.config.scheduling_timeout();
        let ready: Vec<(TaskId, Capability)> = match self.projects.get(&id) {
            Some(project) => project
                .graph
                .ready_tasks()
                .into_iter()
                .map(|t| (t.id, t.required_capability.clone()))
                .collect(),
            None => return,
        };

        let mut unmatched = Vec::new();
        for (task_id, capability) in ready {
            if let Some(agent) = self.registry.find_idle(&capability) {
                if let Err(e) = self.assign(id, task_id, agent, now) {
                    warn!("Assignment of task {} failed: {}", task_id.short(), e);
                }
                continue;
            }
            let capable = self.registry.has_capable(&capability);
            let Some(project) = self.projects.get_mut(&id) else {
                return;
            };
            if capable {
                // Capable agents exist but are occupied; wait for one.
                project.unmatched_since.remove(&task_id);
                continue;
            }
            let since = *project.unmatched_since.entry(task_id).or_insert(now);
            if now.saturating_duration_since(since) >= timeout {
                unmatched.push((task_id, capability));
            } else {
                debug!(
                    "No agent with capability '{}' for task {}",
                    capability,
                    task_id.short()
                );
            }
        }

        for (task_id, capability) in unmatched {
            self.escalate_mismatch(id, task_id, capability);
        }
    }

    fn assign(&mut self, id: ProjectId, task_id: TaskId, agent: AgentId, now: Instant) -> Result<()> {
        let timeout = self.config.assignment_timeout();
        let timeout_secs = timeout.as_secs() as i64;
        let project = self
            .projects
            .get_mut(&id)
            .ok_or(Error::ProjectNotFound { id })?;

        project.graph.mark_assigned(&task_id, &agent)?;
        if let Err(e) = self
            .registry
            .get_mut(&agent)
            .and_then(|record| record.assign(id, task_id))
        {
            project.graph.requeue(&task_id)?;
            return Err(e);
        }
        project.unmatched_since.remove(&task_id);
        project.record_task(&task_id);
        let task = project
            .graph
            .get_task(&task_id)
            .cloned()
            .ok_or(Error::TaskNotFound { id: task_id })?;

        let correlation = CorrelationId::new();
        self.inflight.insert(
            correlation,
            Inflight {
                project_id: id,
                task_id,
                agent_id: agent.clone(),
                deadline: now + timeout,
            },
        );
        info!(
            "Assigned task '{}' ({}) to {}",
            task.name,
            task_id.short(),
            agent
        );
        let message = Message::to_agent(
            ORCHESTRATOR_SENDER,
            &agent,
            MessageKind::Request,
            Payload::Assignment {
                project_id: id,
                task: Box::new(task),
                deadline: Utc::now() + chrono::Duration::seconds(timeout_secs),
            },
        )
        .with_correlation(correlation);
        self.effects.push(Command::Deliver { agent, message });
        Ok(())
    }

    fn escalate_mismatch(&mut self, id: ProjectId, task_id: TaskId, capability: Capability) {
        let err = Error::CapabilityMismatch {
            task: task_id,
            capability,
        };
        error!("{}", err);
        let Some(project) = self.projects.get_mut(&id) else {
            return;
        };
        project.unmatched_since.remove(&task_id);
        match project.graph.mark_failed(&task_id, &err.to_string()) {
            Ok(blocked) => {
                project.record_task(&task_id);
                for blocked_id in &blocked {
                    project.record_task(blocked_id);
                }
            }
            Err(e) => {
                debug!("{}", e);
                return;
            }
        }
        let attempts = project
            .graph
            .get_task(&task_id)
            .map(|t| t.attempt_count)
            .unwrap_or(0);
        project.failure.get_or_insert(FailureNotice {
            project_id: id,
            kind: FailureKind::CapabilityMismatch,
            task_id: Some(task_id),
            attempts,
            last_error: err.to_string(),
        });
        self.check_blocked(id);
    }

    // ========== Stage gates ==========

    fn transition(&mut self, id: ProjectId, stage: Stage) -> Result<()> {
        let project = self.project_mut(id)?;
        let from = project.state.stage();
        project.state.transition(stage)?;
        project.dirty = true;
        let record = project.state.record().clone();
        info!("Project {} stage {} -> {}", id.short(), from, stage);
        self.effects.push(Command::Persist(record));
        Ok(())
    }

    /// Move to blocked and emit the project's single failure notice.
    fn block(&mut self, id: ProjectId, notice: FailureNotice) {
        let Some(project) = self.projects.get_mut(&id) else {
            return;
        };
        if project.state.is_terminal() {
            return;
        }
        project.unmatched_since.clear();
        if let Err(e) = self.transition(id, Stage::Blocked) {
            warn!("{}", e);
            return;
        }
        let Some(project) = self.projects.get_mut(&id) else {
            return;
        };
        if !project.notified {
            project.notified = true;
            error!("{}", notice.summary());
            self.effects.push(Command::Failure(notice));
        }
    }

    fn check_blocked(&mut self, id: ProjectId) {
        let Some(project) = self.projects.get_mut(&id) else {
            return;
        };
        if project.state.is_terminal() || !project.graph.is_blocked() {
            return;
        }
        let notice = project
            .failure
            .take()
            .unwrap_or_else(|| project.fallback_notice(id));
        self.block(id, notice);
    }

    /// Evaluate the gate of the current stage after a task completed.
    fn advance(&mut self, id: ProjectId, now: Instant) {
        let Some(project) = self.projects.get(&id) else {
            return;
        };
        match project.state.stage() {
            Stage::Building => {
                if project.graph.is_kind_resolved(TaskKind::Build) {
                    self.enter_check(id, Stage::Review);
                }
            }
            Stage::Review => self.evaluate_check(id, TaskKind::Review, now),
            Stage::Testing => self.evaluate_check(id, TaskKind::Test, now),
            _ => {}
        }
    }

    /// Enter review or testing and add the round's check task.
    fn enter_check(&mut self, id: ProjectId, stage: Stage) {
        let (kind, capability, verb) = match stage {
            Stage::Review => (TaskKind::Review, self.config.review_capability(), "Review"),
            _ => (TaskKind::Test, self.config.test_capability(), "Test"),
        };
        if let Err(e) = self.transition(id, stage) {
            warn!("{}", e);
            return;
        }
        let Some(project) = self.projects.get_mut(&id) else {
            return;
        };
        let round = project.state.remediation_loops();
        let builds: Vec<TaskId> = project
            .graph
            .all_tasks()
            .into_iter()
            .filter(|t| t.kind == TaskKind::Build)
            .map(|t| t.id)
            .collect();
        let task = Task::new(
            &format!("{}-{}", kind, round),
            &format!("{} the build output of '{}'", verb, project.state.record().name),
            capability,
        )
        .with_kind(kind)
        .with_round(round)
        .with_priority(Priority::High);
        match project.graph.add_task(task, &builds) {
            Ok(task_id) => project.record_task(&task_id),
            Err(e) => warn!("Could not add {} task: {}", kind, e),
        }
        self.promote(id);
    }

    fn evaluate_check(&mut self, id: ProjectId, kind: TaskKind, now: Instant) {
        let Some(project) = self.projects.get(&id) else {
            return;
        };
        let round = project.state.remediation_loops();
        let checks = project.graph.tasks_in_round(kind, round);
        if checks.is_empty() || !checks.iter().all(|t| t.is_completed()) {
            return;
        }
        let findings: Vec<Finding> = checks
            .iter()
            .filter_map(|t| t.result.as_ref())
            .flat_map(|r| r.findings.iter().cloned())
            .collect();

        if !findings.is_empty() {
            self.remediate(id, kind, findings, now);
            return;
        }
        match kind {
            TaskKind::Review => self.enter_check(id, Stage::Testing),
            _ => {
                if let Err(e) = self.transition(id, Stage::Delivery) {
                    warn!("{}", e);
                } else {
                    info!("Project {} delivered", id.short());
                }
            }
        }
    }

    /// Loop back into building with one task per finding.
    fn remediate(&mut self, id: ProjectId, kind: TaskKind, findings: Vec<Finding>, now: Instant) {
        let Some(project) = self.projects.get(&id) else {
            return;
        };
        let loops = project.state.remediation_loops();
        if loops >= self.config.max_remediation_loops {
            let check = project
                .graph
                .tasks_in_round(kind, loops)
                .first()
                .map(|t| t.id);
            self.block(
                id,
                FailureNotice {
                    project_id: id,
                    kind: FailureKind::RemediationLimit,
                    task_id: check,
                    attempts: loops,
                    last_error: format!(
                        "{} finding(s) still open after {} remediation loop(s)",
                        findings.len(),
                        loops
                    ),
                },
            );
            return;
        }

        info!(
            "Project {} {} reported {} finding(s), looping back to building",
            id.short(),
            kind,
            findings.len()
        );
        if let Err(e) = self.transition(id, Stage::Building) {
            warn!("{}", e);
            return;
        }
        let fallback = self.config.remediation_capability();
        let Some(project) = self.projects.get_mut(&id) else {
            return;
        };
        let round = project.state.remediation_loops();
        let batch: Vec<(Task, Vec<TaskId>)> = findings
            .into_iter()
            .enumerate()
            .map(|(i, finding)| {
                let capability = finding.capability.unwrap_or_else(|| fallback.clone());
                let task = Task::new(
                    &format!("fix-{}-{}", round, i + 1),
                    &finding.description,
                    capability,
                )
                .with_round(round)
                .with_priority(Priority::High);
                (task, Vec::new())
            })
            .collect();
        match project.graph.add_batch(batch) {
            Ok(ids) => {
                for task_id in &ids {
                    project.record_task(task_id);
                }
            }
            Err(e) => warn!("Could not add remediation tasks: {}", e),
        }
        self.promote(id);
        self.schedule(now);
    }

    // ========== Status ==========

    /// Emit one status event per project that changed.
    fn flush(&mut self) {
        let agents = self.registry.statuses();
        for id in &self.order {
            let Some(project) = self.projects.get_mut(id) else {
                continue;
            };
            if !project.dirty {
                continue;
            }
            project.dirty = false;
            self.effects.push(Command::Status(StatusEvent {
                project_id: *id,
                stage: project.state.stage(),
                agent_statuses: agents.clone(),
                task_events: std::mem::take(&mut project.task_events),
            }));
        }
    }
}
