//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Fast configurations for timer-driven behaviour
//! - Scripted, slow and silent capability providers
//! - A harness wiring bus, orchestrator, gateway and workers together

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use forge::actors::ActorHandle;
use forge::agent::{AgentId, AgentStatus};
use forge::bus::MessageBus;
use forge::config::Config;
use forge::core::task::{Capability, Finding, Task};
use forge::orchestration::{
    CapabilityProvider, ChannelGateway, FailureNotice, GatewayEvent, MemoryArtifactStore,
    MemoryProjectStore, Orchestrator, Plan, PlannedTask, Planner, ProjectSnapshot, ProjectStore,
    ProviderError, ProviderOutput, StaticPlanner, StatusEvent, Worker,
};
use forge::{ProjectId, Stage};

/// Upper bound for any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

/// Worker heartbeat interval used by the harness.
pub const HEARTBEAT: Duration = Duration::from_millis(100);

/// Defaults with a fast orchestrator tick.
pub fn fast_config() -> Config {
    Config {
        tick_interval_ms: 10,
        ..Default::default()
    }
}

pub fn planner(tasks: Vec<PlannedTask>) -> Box<dyn Planner> {
    Box::new(StaticPlanner::new(Plan::new(tasks)))
}

/// One scripted provider outcome.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed(ProviderOutput),
    Findings(Vec<&'static str>),
    Fail(&'static str),
}

/// Provider that replays scripted outcomes per task name.
///
/// Tasks without a script (or whose script has run out) succeed and write
/// one file named after the task.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<String>>,
    delay: Duration,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn script(self, task: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(task.to_string(), steps.into());
        self
    }

    /// Every task name invoked, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, task: &str) -> usize {
        self.calls().iter().filter(|name| *name == task).count()
    }
}

#[async_trait]
impl CapabilityProvider for ScriptedProvider {
    async fn invoke(&self, task: &Task) -> Result<ProviderOutput, ProviderError> {
        self.calls.lock().unwrap().push(task.name.clone());
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&task.name)
            .and_then(VecDeque::pop_front);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match step {
            Some(Step::Succeed(output)) => Ok(output),
            Some(Step::Findings(items)) => Ok(items.into_iter().fold(
                ProviderOutput::new("issues found"),
                |out, item| out.with_finding(Finding::new(item)),
            )),
            Some(Step::Fail(error)) => Err(ProviderError::Failed(error.to_string())),
            None => Ok(ProviderOutput::new(&format!("{} done", task.name))
                .with_file(&format!("{}.txt", task.name), &task.description)),
        }
    }
}

/// Provider whose calls never finish within a test.
pub struct SlowProvider {
    calls: Mutex<usize>,
}

impl SlowProvider {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl CapabilityProvider for SlowProvider {
    async fn invoke(&self, _task: &Task) -> Result<ProviderOutput, ProviderError> {
        *self.calls.lock().unwrap() += 1;
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(ProviderOutput::new("too late"))
    }
}

/// A running orchestrator with its bus, gateway and workers.
pub struct Harness {
    pub bus: MessageBus,
    pub orchestrator: Orchestrator,
    pub events: mpsc::UnboundedReceiver<GatewayEvent>,
    pub artifacts: Arc<MemoryArtifactStore>,
    pub store: Arc<dyn ProjectStore>,
    handle: ActorHandle,
    workers: Vec<ActorHandle>,
}

impl Harness {
    pub fn start(config: Config, planner: Box<dyn Planner>) -> Self {
        Self::with_store(config, planner, Arc::new(MemoryProjectStore::new()))
    }

    pub fn with_store(config: Config, planner: Box<dyn Planner>, store: Arc<dyn ProjectStore>) -> Self {
        let bus = MessageBus::from_config(&config);
        let (gateway, events) = ChannelGateway::new();
        let (orchestrator, handle) =
            Orchestrator::spawn(config, planner, bus.clone(), Arc::new(gateway), store.clone())
                .expect("orchestrator should start");
        Self {
            bus,
            orchestrator,
            events,
            artifacts: Arc::new(MemoryArtifactStore::new()),
            store,
            handle,
            workers: Vec::new(),
        }
    }

    /// Spawn a worker and register it with the orchestrator.
    pub async fn add_worker(
        &mut self,
        name: &str,
        capabilities: &[&str],
        provider: Arc<dyn CapabilityProvider>,
    ) -> AgentId {
        let id = AgentId::new(name);
        let caps: Vec<Capability> = capabilities.iter().map(|c| Capability::new(c)).collect();
        let handle = Worker::new(
            id.clone(),
            caps.clone(),
            provider,
            self.artifacts.clone(),
            self.bus.clone(),
        )
        .with_heartbeat_interval(HEARTBEAT)
        .spawn();
        self.workers.push(handle);
        self.orchestrator
            .register_agent(id.clone(), caps)
            .await
            .expect("agent should register");
        id
    }

    pub async fn submit(&self, request: &str) -> ProjectId {
        self.orchestrator
            .handle_request(forge::ProjectRequest::new(request))
            .await
            .expect("request should be accepted")
    }

    /// Poll the snapshot until the project reaches `stage`.
    pub async fn wait_for_stage(&self, id: ProjectId, stage: Stage) -> ProjectSnapshot {
        let result = tokio::time::timeout(WAIT, async {
            loop {
                let snapshot = self.orchestrator.snapshot(id).await.unwrap();
                if snapshot.record.stage == stage {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        match result {
            Ok(snapshot) => snapshot,
            Err(_) => {
                let snapshot = self.orchestrator.snapshot(id).await.unwrap();
                panic!(
                    "project never reached {:?}; stuck in {:?} with tasks {:#?}",
                    stage, snapshot.record.stage, snapshot.tasks
                );
            }
        }
    }

    pub async fn agent(&self, id: &AgentId) -> AgentStatus {
        self.orchestrator
            .agents()
            .await
            .unwrap()
            .into_iter()
            .find(|a| &a.agent_id == id)
            .expect("agent should be registered")
    }

    /// Drain gateway events for `window`, splitting statuses and failures.
    pub async fn drain(&mut self, window: Duration) -> (Vec<StatusEvent>, Vec<FailureNotice>) {
        let mut statuses = Vec::new();
        let mut failures = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, self.events.recv()).await {
            match event {
                GatewayEvent::Status(status) => statuses.push(status),
                GatewayEvent::Failure(notice) => failures.push(notice),
            }
        }
        (statuses, failures)
    }

    pub async fn shutdown(self) {
        for worker in self.workers {
            worker.join().await.unwrap();
        }
        self.handle.join().await.unwrap();
        self.bus.shutdown();
    }
}
