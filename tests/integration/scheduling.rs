//! Scheduling tests.
//!
//! These tests verify dependency ordering, that an agent never holds more
//! than one assignment, and that invalid plans never reach a worker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use forge::agent::AgentId;
use forge::bus::Payload;
use forge::core::task::{Capability, Task, TaskStatus};
use forge::orchestration::{
    CapabilityProvider, Command, FailureKind, PlannedTask, ProviderError, ProviderOutput,
};
use forge::{Error, OrchestratorCore, ProjectId, ProjectRequest, Stage};

use crate::fixtures::{fast_config, planner, Harness, ScriptedProvider};

/// Provider that records the highest number of concurrent calls.
struct ConcurrencyProbe {
    running: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

impl ConcurrencyProbe {
    fn new() -> Self {
        Self {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CapabilityProvider for ConcurrencyProbe {
    async fn invoke(&self, task: &Task) -> Result<ProviderOutput, ProviderError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(ProviderOutput::new(&format!("{} done", task.name)))
    }
}

/// Task names of the assignments in `effects`, in delivery order.
fn assigned(effects: Vec<Command>) -> Vec<(AgentId, String)> {
    effects
        .into_iter()
        .filter_map(|c| match c {
            Command::Deliver { agent, message } => match message.payload {
                Payload::Assignment { task, .. } => Some((agent, task.name.clone())),
                _ => None,
            },
            _ => None,
        })
        .collect()
}

/// Test: Dependency chain runs in order
/// Given tasks a -> b -> c and two capable workers
/// When the project runs
/// Then the provider sees a, b, c strictly in that order
#[tokio::test]
async fn test_dependency_chain_runs_in_order() {
    let mut harness = Harness::start(
        fast_config(),
        planner(vec![
            PlannedTask::new("a", "first", "backend"),
            PlannedTask::new("b", "second", "backend").after(&["a"]),
            PlannedTask::new("c", "third", "backend").after(&["b"]),
        ]),
    );
    let provider = Arc::new(ScriptedProvider::new().with_delay(Duration::from_millis(20)));
    harness.add_worker("be-1", &["backend"], provider.clone()).await;
    harness.add_worker("be-2", &["backend"], provider.clone()).await;
    harness.add_worker("reviewer", &["review"], provider.clone()).await;
    harness.add_worker("qa", &["test"], provider.clone()).await;

    let id = harness.submit("Chained API work").await;
    harness.wait_for_stage(id, Stage::Delivery).await;

    let builds: Vec<String> = provider
        .calls()
        .into_iter()
        .filter(|name| ["a", "b", "c"].contains(&name.as_str()))
        .collect();
    assert_eq!(builds, vec!["a", "b", "c"]);
    harness.shutdown().await;
}

/// Test: One assignment per agent
/// Given six independent tasks and two capable workers
/// When the project runs
/// Then no more than two tasks ever run at once and every task runs once
#[tokio::test]
async fn test_agent_holds_one_assignment_at_a_time() {
    let tasks = (1..=6)
        .map(|n| PlannedTask::new(&format!("t{}", n), "independent work", "backend"))
        .collect();
    let mut harness = Harness::start(fast_config(), planner(tasks));
    let probe = Arc::new(ConcurrencyProbe::new());
    let checks = Arc::new(ScriptedProvider::new());
    harness.add_worker("be-1", &["backend"], probe.clone()).await;
    harness.add_worker("be-2", &["backend"], probe.clone()).await;
    harness.add_worker("reviewer", &["review"], checks.clone()).await;
    harness.add_worker("qa", &["test"], checks.clone()).await;

    let id = harness.submit("Six endpoints").await;
    let snapshot = harness.wait_for_stage(id, Stage::Delivery).await;

    assert!(probe.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(probe.total.load(Ordering::SeqCst), 6);
    assert!(snapshot
        .tasks
        .iter()
        .all(|t| t.status == TaskStatus::Completed && t.attempt_count == 1));
    harness.shutdown().await;
}

/// Test: Cyclic plan is rejected
/// Given a plan where a and b depend on each other
/// When the request is submitted
/// Then it fails with a cycle error, nothing executes, and one notice is sent
#[tokio::test]
async fn test_cyclic_plan_never_executes() {
    let mut harness = Harness::start(
        fast_config(),
        planner(vec![
            PlannedTask::new("a", "x", "backend").after(&["b"]),
            PlannedTask::new("b", "y", "backend").after(&["a"]),
        ]),
    );
    let provider = Arc::new(ScriptedProvider::new());
    let worker = harness.add_worker("be-1", &["backend"], provider.clone()).await;

    let id = ProjectId::new();
    let result = harness
        .orchestrator
        .handle_request(ProjectRequest::new("Circular").with_id(id))
        .await;
    assert!(matches!(result, Err(Error::DependencyCycle { .. })));

    let (_, failures) = harness.drain(Duration::from_millis(200)).await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, FailureKind::DependencyCycle);
    assert!(provider.calls().is_empty());

    let snapshot = harness.orchestrator.snapshot(id).await.unwrap();
    assert_eq!(snapshot.record.stage, Stage::Blocked);
    assert!(snapshot.tasks.is_empty());
    assert!(harness.agent(&worker).await.current_task.is_none());
    harness.shutdown().await;
}

/// Test: Unknown dependency is rejected
/// Given a plan whose task depends on a key that does not exist
/// When the request is submitted
/// Then only the caller sees the validation error and the worker stays idle
#[tokio::test]
async fn test_unknown_dependency_rejected() {
    let mut harness = Harness::start(
        fast_config(),
        planner(vec![PlannedTask::new("a", "x", "backend").after(&["ghost"])]),
    );
    let provider = Arc::new(ScriptedProvider::new());
    harness.add_worker("be-1", &["backend"], provider.clone()).await;

    let result = harness
        .orchestrator
        .handle_request(ProjectRequest::new("Haunted"))
        .await;
    assert!(matches!(result, Err(Error::Validation(_))));

    let (_, failures) = harness.drain(Duration::from_millis(100)).await;
    assert!(failures.is_empty());
    assert!(provider.calls().is_empty());
    harness.shutdown().await;
}

/// Test: Fan-out dispatch in one pass
/// Given a -> {b, c} and two idle backend agents
/// When a completes
/// Then b and c are both assigned in the same pass, b first
#[test]
fn test_fan_out_dispatched_in_one_pass() {
    let mut core = OrchestratorCore::new(
        fast_config(),
        planner(vec![
            PlannedTask::new("a", "root", "backend"),
            PlannedTask::new("b", "left", "backend").after(&["a"]),
            PlannedTask::new("c", "right", "backend").after(&["a"]),
        ]),
    );
    let now = Instant::now();
    for name in ["be-1", "be-2"] {
        core.register_agent(AgentId::new(name), vec![Capability::new("backend")], now)
            .unwrap();
    }
    let id = core
        .handle_request(ProjectRequest::new("Fan out"), now)
        .unwrap();

    let effects = core.take_effects();
    let (agent, correlation, task) = effects
        .iter()
        .find_map(|c| match c {
            Command::Deliver { agent, message } => match &message.payload {
                Payload::Assignment { task, .. } => {
                    Some((agent.clone(), message.correlation_id, task.clone()))
                }
                _ => None,
            },
            _ => None,
        })
        .expect("a should be assigned");
    assert_eq!(task.name, "a");

    let report = forge::bus::Message::to_topic(
        agent.as_str(),
        forge::bus::ORCHESTRATOR_TOPIC,
        forge::bus::MessageKind::Response,
        Payload::TaskCompleted {
            project_id: id,
            task_id: task.id,
            agent_id: agent.clone(),
            result: forge::core::task::TaskResult::new("ok"),
        },
    )
    .with_correlation(correlation.expect("assignment carries a correlation id"));
    core.handle_message(report, now);

    let next = assigned(core.take_effects());
    let names: Vec<&str> = next.iter().map(|(_, name)| name.as_str()).collect();
    assert_eq!(names, vec!["b", "c"]);
    assert_ne!(next[0].0, next[1].0);
    assert_eq!(core.inflight_count(), 2);
}
