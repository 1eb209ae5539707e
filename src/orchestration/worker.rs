//! Worker runtime.
//!
//! A `Worker` is one agent: it owns an inbox on the bus, publishes
//! heartbeats, and runs each assignment through its `CapabilityProvider`.
//! Files the provider returns go to the `ArtifactStore`; the report that
//! goes back to the orchestrator carries only their paths.
//!
//! Workers never talk to each other. Everything they learn arrives in their
//! inbox and everything they say goes to the orchestrator topic.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::actors::ActorHandle;
use crate::agent::AgentId;
use crate::bus::{CorrelationId, Message, MessageBus, MessageKind, Payload, ORCHESTRATOR_TOPIC};
use crate::config::Config;
use crate::core::task::{Capability, Task, TaskId, TaskResult};
use crate::project::ProjectId;

use super::interfaces::{ArtifactStore, CapabilityProvider, ProviderError, ProviderOutput};

/// The assignment a worker is currently running.
struct Job {
    project_id: ProjectId,
    task_id: TaskId,
    cancel: CancellationToken,
}

impl Job {
    fn matches(&self, project_id: ProjectId, task_id: Option<TaskId>) -> bool {
        self.project_id == project_id && task_id.map_or(true, |t| t == self.task_id)
    }
}

/// Everything a running job needs, cloned into its task.
#[derive(Clone)]
struct Context {
    id: AgentId,
    provider: Arc<dyn CapabilityProvider>,
    artifacts: Arc<dyn ArtifactStore>,
    bus: MessageBus,
    waiting_after: Option<Duration>,
}

impl Context {
    async fn report(&self, kind: MessageKind, payload: Payload, correlation: Option<CorrelationId>) {
        let mut message = Message::to_topic(self.id.as_str(), ORCHESTRATOR_TOPIC, kind, payload);
        if let Some(correlation) = correlation {
            message = message.with_correlation(correlation);
        }
        if let Err(e) = self.bus.publish(ORCHESTRATOR_TOPIC, message).await {
            warn!("Worker {} could not report: {}", self.id, e);
        }
    }

    async fn fail(&self, project_id: ProjectId, task_id: TaskId, correlation: Option<CorrelationId>, error: String) {
        warn!("Worker {} failed task {}: {}", self.id, task_id.short(), error);
        self.report(
            MessageKind::Error,
            Payload::TaskFailed {
                project_id,
                task_id,
                agent_id: self.id.clone(),
                error,
            },
            correlation,
        )
        .await;
    }

    /// Call the provider, reporting `waiting` if it takes a while.
    async fn invoke(
        &self,
        project_id: ProjectId,
        task: &Task,
        correlation: Option<CorrelationId>,
    ) -> std::result::Result<ProviderOutput, ProviderError> {
        let call = AssertUnwindSafe(self.provider.invoke(task)).catch_unwind();
        tokio::pin!(call);
        let result = match self.waiting_after {
            None => call.await,
            Some(after) => match tokio::time::timeout(after, &mut call).await {
                Ok(result) => result,
                Err(_) => {
                    self.report(
                        MessageKind::Status,
                        Payload::AgentWaiting {
                            project_id,
                            task_id: task.id,
                            agent_id: self.id.clone(),
                        },
                        correlation,
                    )
                    .await;
                    call.await
                }
            },
        };
        result.unwrap_or_else(|_| Err(ProviderError::Failed("provider panicked".to_string())))
    }

    async fn run(
        self,
        project_id: ProjectId,
        task: Task,
        correlation: Option<CorrelationId>,
        budget: Duration,
        cancel: CancellationToken,
        done: mpsc::UnboundedSender<TaskId>,
    ) {
        let task_id = task.id;
        self.report(
            MessageKind::Notification,
            Payload::TaskStarted {
                project_id,
                task_id,
                agent_id: self.id.clone(),
            },
            correlation,
        )
        .await;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(budget, self.invoke(project_id, &task, correlation)) => Some(result),
        };

        match outcome {
            None => info!("Worker {} abandoned task {}", self.id, task_id.short()),
            Some(Err(_)) => {
                self.fail(project_id, task_id, correlation, format!("deadline of {:?} exceeded", budget))
                    .await
            }
            Some(Ok(Err(e))) => self.fail(project_id, task_id, correlation, e.to_string()).await,
            Some(Ok(Ok(output))) => {
                match self.store(project_id, output).await {
                    Ok(result) if !cancel.is_cancelled() => {
                        info!("Worker {} completed task '{}'", self.id, task.name);
                        self.report(
                            MessageKind::Response,
                            Payload::TaskCompleted {
                                project_id,
                                task_id,
                                agent_id: self.id.clone(),
                                result,
                            },
                            correlation,
                        )
                        .await;
                    }
                    Ok(_) => info!("Worker {} abandoned task {}", self.id, task_id.short()),
                    Err(e) => self.fail(project_id, task_id, correlation, e).await,
                }
            }
        }
        let _ = done.send(task_id);
    }

    /// Write the provider's files and build the result that references them.
    async fn store(&self, project_id: ProjectId, output: ProviderOutput) -> std::result::Result<TaskResult, String> {
        let mut paths = Vec::with_capacity(output.files.len());
        for file in &output.files {
            self.artifacts
                .write(project_id, &file.path, &file.content)
                .await
                .map_err(|e| format!("artifact '{}' not stored: {}", file.path, e))?;
            paths.push(file.path.clone());
        }
        Ok(TaskResult::new(&output.summary)
            .with_artifacts(paths)
            .with_findings(output.findings))
    }
}

pub struct Worker {
    context: Context,
    capabilities: Vec<Capability>,
    heartbeat_interval: Duration,
}

impl Worker {
    pub fn new(
        id: AgentId,
        capabilities: Vec<Capability>,
        provider: Arc<dyn CapabilityProvider>,
        artifacts: Arc<dyn ArtifactStore>,
        bus: MessageBus,
    ) -> Self {
        Self {
            context: Context {
                id,
                provider,
                artifacts,
                bus,
                waiting_after: None,
            },
            capabilities,
            heartbeat_interval: Config::default().heartbeat_interval(),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Report `waiting` when a provider call runs longer than `after`.
    pub fn with_waiting_after(mut self, after: Duration) -> Self {
        self.context.waiting_after = Some(after);
        self
    }

    pub fn id(&self) -> &AgentId {
        &self.context.id
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    /// Register the inbox and start the worker loop.
    ///
    /// The inbox exists once this returns, so the agent can be registered
    /// with the orchestrator straight away.
    pub fn spawn(self) -> ActorHandle {
        let cancel = CancellationToken::new();
        let inbox = self.context.bus.register_inbox(&self.context.id);
        debug!("Worker::spawn {}", self.context.id);
        let task = tokio::spawn(self.run(inbox, cancel.clone()));
        ActorHandle::new(cancel).with_task(task)
    }

    async fn run(self, mut inbox: mpsc::Receiver<Message>, cancel: CancellationToken) {
        let ctx = self.context;
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let mut current: Option<Job> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Worker {} cancelled", ctx.id);
                    break;
                }
                message = inbox.recv() => {
                    let Some(message) = message else {
                        debug!("Worker {}: inbox closed", ctx.id);
                        break;
                    };
                    let correlation = message.correlation_id;
                    match message.payload {
                        Payload::Assignment { project_id, task, deadline } => {
                            if let Some(job) = &current {
                                warn!(
                                    "Worker {} got task {} while running {}",
                                    ctx.id,
                                    task.id.short(),
                                    job.task_id.short()
                                );
                                ctx.fail(project_id, task.id, correlation, format!("agent {} is busy", ctx.id))
                                    .await;
                                continue;
                            }
                            let budget = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                            let job_cancel = cancel.child_token();
                            current = Some(Job {
                                project_id,
                                task_id: task.id,
                                cancel: job_cancel.clone(),
                            });
                            debug!("Worker {} starting task '{}'", ctx.id, task.name);
                            tokio::spawn(ctx.clone().run(
                                project_id,
                                *task,
                                correlation,
                                budget,
                                job_cancel,
                                done_tx.clone(),
                            ));
                        }
                        Payload::Cancel { project_id, task_id } => {
                            if current.as_ref().is_some_and(|job| job.matches(project_id, task_id)) {
                                if let Some(job) = current.take() {
                                    info!("Worker {} cancelling task {}", ctx.id, job.task_id.short());
                                    job.cancel.cancel();
                                }
                            }
                        }
                        other => trace!("Worker {} ignoring {}", ctx.id, other.name()),
                    }
                }
                Some(task_id) = done_rx.recv() => {
                    if current.as_ref().is_some_and(|job| job.task_id == task_id) {
                        current = None;
                    }
                }
                _ = heartbeat.tick() => {
                    ctx.report(
                        MessageKind::Status,
                        Payload::Heartbeat { agent_id: ctx.id.clone() },
                        None,
                    )
                    .await;
                }
            }
        }

        if let Some(job) = current {
            job.cancel.cancel();
        }
        ctx.bus.unregister_inbox(&ctx.id);
    }
}
