//! Orchestrator actor.
//!
//! `Orchestrator` is a cheap, cloneable handle. The actor behind it owns the
//! `OrchestratorCore` and a single processing queue: gateway calls, worker
//! reports from the bus, and timer ticks are handled one at a time, in
//! arrival order. After every event the actor executes the commands the core
//! queued: direct deliveries, gateway notifications and record persistence.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::actors::ActorHandle;
use crate::agent::{AgentId, AgentStatus};
use crate::bus::{ChannelHandler, Message, MessageBus, SubscriptionId, ORCHESTRATOR_TOPIC};
use crate::config::Config;
use crate::core::task::Capability;
use crate::error::{Error, Result};
use crate::project::{ProjectId, ProjectRecord, ProjectRequest};

use super::command::Command;
use super::core::{OrchestratorCore, ProjectSnapshot};
use super::interfaces::{Gateway, ProjectStore};
use super::planner::Planner;

const REQUEST_QUEUE: usize = 64;

enum Request {
    Submit {
        request: ProjectRequest,
        reply: oneshot::Sender<Result<ProjectId>>,
    },
    Cancel {
        project_id: ProjectId,
        reply: oneshot::Sender<Result<()>>,
    },
    Register {
        agent_id: AgentId,
        capabilities: Vec<Capability>,
        reply: oneshot::Sender<Result<()>>,
    },
    Unregister {
        agent_id: AgentId,
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        project_id: ProjectId,
        reply: oneshot::Sender<Result<ProjectSnapshot>>,
    },
    Archive {
        project_id: ProjectId,
        reply: oneshot::Sender<Result<ProjectRecord>>,
    },
    Agents {
        reply: oneshot::Sender<Vec<AgentStatus>>,
    },
}

/// Handle to the orchestrator actor.
#[derive(Clone)]
pub struct Orchestrator {
    tx: mpsc::Sender<Request>,
}

impl Orchestrator {
    /// Start the actor and subscribe it to worker reports.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        config: Config,
        planner: Box<dyn Planner>,
        bus: MessageBus,
        gateway: Arc<dyn Gateway>,
        store: Arc<dyn ProjectStore>,
    ) -> Result<(Self, ActorHandle)> {
        let (report_tx, reports) = mpsc::channel(config.topic_capacity.max(1));
        let subscription = bus.subscribe(
            ORCHESTRATOR_TOPIC,
            "orchestrator",
            Arc::new(ChannelHandler::new(report_tx)),
        )?;
        let (tx, requests) = mpsc::channel(REQUEST_QUEUE);

        let cancel = CancellationToken::new();
        let actor = OrchestratorActor {
            core: OrchestratorCore::new(config, planner),
            bus,
            gateway,
            store,
            requests,
            reports,
            subscription,
        };
        debug!("Orchestrator::spawn");
        let task = tokio::spawn(actor.run(cancel.clone()));

        Ok((Self { tx }, ActorHandle::new(cancel).with_task(task)))
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| Error::OrchestratorStopped)?;
        rx.await.map_err(|_| Error::OrchestratorStopped)
    }

    /// Validate, plan and start a project.
    pub async fn handle_request(&self, request: ProjectRequest) -> Result<ProjectId> {
        self.call(|reply| Request::Submit { request, reply }).await?
    }

    pub async fn cancel(&self, project_id: ProjectId) -> Result<()> {
        self.call(|reply| Request::Cancel { project_id, reply }).await?
    }

    pub async fn register_agent(&self, agent_id: AgentId, capabilities: Vec<Capability>) -> Result<()> {
        self.call(|reply| Request::Register {
            agent_id,
            capabilities,
            reply,
        })
        .await?
    }

    pub async fn unregister_agent(&self, agent_id: AgentId) -> Result<()> {
        self.call(|reply| Request::Unregister { agent_id, reply }).await?
    }

    pub async fn snapshot(&self, project_id: ProjectId) -> Result<ProjectSnapshot> {
        self.call(|reply| Request::Snapshot { project_id, reply }).await?
    }

    /// Drop a finished project and return its final record.
    pub async fn archive(&self, project_id: ProjectId) -> Result<ProjectRecord> {
        self.call(|reply| Request::Archive { project_id, reply }).await?
    }

    pub async fn agents(&self) -> Result<Vec<AgentStatus>> {
        self.call(|reply| Request::Agents { reply }).await
    }
}

struct OrchestratorActor {
    core: OrchestratorCore,
    bus: MessageBus,
    gateway: Arc<dyn Gateway>,
    store: Arc<dyn ProjectStore>,
    requests: mpsc::Receiver<Request>,
    reports: mpsc::Receiver<Message>,
    subscription: SubscriptionId,
}

impl OrchestratorActor {
    async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.core.config().tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Orchestrator started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Orchestrator cancelled");
                    break;
                }
                request = self.requests.recv() => {
                    let Some(request) = request else {
                        debug!("Orchestrator: all handles dropped");
                        break;
                    };
                    self.handle(request);
                }
                Some(message) = self.reports.recv() => {
                    self.core.handle_message(message, Instant::now());
                }
                _ = ticker.tick() => {
                    self.core.tick(Instant::now());
                }
            }
            self.execute().await;
        }

        self.bus.unsubscribe(self.subscription);
        info!("Orchestrator stopped");
    }

    fn handle(&mut self, request: Request) {
        let now = Instant::now();
        match request {
            Request::Submit { request, reply } => {
                let _ = reply.send(self.core.handle_request(request, now));
            }
            Request::Cancel { project_id, reply } => {
                let _ = reply.send(self.core.cancel(project_id, now));
            }
            Request::Register {
                agent_id,
                capabilities,
                reply,
            } => {
                let _ = reply.send(self.core.register_agent(agent_id, capabilities, now));
            }
            Request::Unregister { agent_id, reply } => {
                let _ = reply.send(self.core.unregister_agent(&agent_id, now));
            }
            Request::Snapshot { project_id, reply } => {
                let _ = reply.send(self.core.snapshot(project_id));
            }
            Request::Archive { project_id, reply } => {
                let _ = reply.send(self.core.archive(project_id));
            }
            Request::Agents { reply } => {
                let _ = reply.send(self.core.agent_statuses());
            }
        }
    }

    /// Run queued commands until the core stops producing new ones.
    ///
    /// Deliveries never wait on a worker: a full inbox is a failed delivery,
    /// which feeds back into the core and may queue more.
    async fn execute(&mut self) {
        loop {
            let commands = self.core.take_effects();
            if commands.is_empty() {
                return;
            }
            for command in commands {
                trace!("Executing {} command", command.name());
                match command {
                    Command::Deliver { agent, message } => {
                        let correlation = message.correlation_id;
                        if let Err(e) = self.bus.try_send_direct(&agent, message) {
                            warn!("Delivery to {} failed: {}", agent, e);
                            if let Some(correlation) = correlation {
                                self.core
                                    .delivery_failed(correlation, &e.to_string(), Instant::now());
                            }
                        }
                    }
                    Command::Status(event) => self.gateway.status(event).await,
                    Command::Failure(notice) => self.gateway.failure(notice).await,
                    Command::Persist(record) => {
                        if let Err(e) = self.store.save(&record).await {
                            warn!("Failed to persist project {}: {}", record.id.short(), e);
                        }
                    }
                }
            }
        }
    }
}
