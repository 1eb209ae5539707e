//! Failure recovery tests.
//!
//! These tests verify retries, fatal failures, deadline expiry, heartbeat
//! loss, unmatched capabilities and cancellation, each ending with a single
//! notice to the gateway.

use std::sync::Arc;
use std::time::Duration;

use forge::agent::{AgentId, AgentState};
use forge::config::Config;
use forge::core::task::{Capability, TaskStatus};
use forge::orchestration::{FailureKind, PlannedTask};
use forge::Stage;

use crate::fixtures::{fast_config, planner, Harness, ScriptedProvider, SlowProvider, Step};

/// Test: Retry limit exhausted
/// Given a task x that fails every attempt and a dependent y
/// When the project runs with three attempts allowed
/// Then x fails after three calls, y is blocked, and exactly one notice is sent
#[tokio::test]
async fn test_fatal_task_blocks_dependents_once() {
    let mut harness = Harness::start(
        fast_config(),
        planner(vec![
            PlannedTask::new("x", "flaky", "backend"),
            PlannedTask::new("y", "depends on x", "backend").after(&["x"]),
        ]),
    );
    let provider = Arc::new(ScriptedProvider::new().script(
        "x",
        vec![Step::Fail("boom 1"), Step::Fail("boom 2"), Step::Fail("boom 3")],
    ));
    harness.add_worker("be-1", &["backend"], provider.clone()).await;

    let id = harness.submit("Flaky API").await;
    let snapshot = harness.wait_for_stage(id, Stage::Blocked).await;

    assert_eq!(provider.call_count("x"), 3);
    assert_eq!(provider.call_count("y"), 0);
    let x = snapshot.tasks.iter().find(|t| t.name == "x").unwrap();
    assert!(matches!(x.status, TaskStatus::Failed { .. }));
    assert_eq!(x.attempt_count, 3);
    let y = snapshot.tasks.iter().find(|t| t.name == "y").unwrap();
    assert!(matches!(y.status, TaskStatus::Blocked { .. }));

    let (_, failures) = harness.drain(Duration::from_millis(200)).await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, FailureKind::FatalTask);
    assert_eq!(failures[0].task_id, Some(x.id));
    assert_eq!(failures[0].attempts, 3);
    assert!(failures[0].last_error.contains("boom 3"));
    harness.shutdown().await;
}

/// Test: Fatal failure alongside unrelated work
/// Given x (backend) with a dependent, and an independent frontend task
/// When x exhausts its attempts while the frontend task is still running
/// Then the project blocks once the frontend task completes, with one notice
#[tokio::test]
async fn test_fatal_task_blocks_after_independent_work_completes() {
    let mut harness = Harness::start(
        fast_config(),
        planner(vec![
            PlannedTask::new("x", "flaky", "backend"),
            PlannedTask::new("dep", "depends on x", "backend").after(&["x"]),
            PlannedTask::new("other", "unrelated page", "frontend"),
        ]),
    );
    let backend = Arc::new(ScriptedProvider::new().script(
        "x",
        vec![Step::Fail("boom 1"), Step::Fail("boom 2"), Step::Fail("boom 3")],
    ));
    let frontend = Arc::new(ScriptedProvider::new().with_delay(Duration::from_millis(500)));
    harness.add_worker("be-1", &["backend"], backend.clone()).await;
    harness.add_worker("fe-1", &["frontend"], frontend.clone()).await;

    let id = harness.submit("Shop with a flaky API").await;
    let snapshot = harness.wait_for_stage(id, Stage::Blocked).await;

    assert_eq!(backend.call_count("x"), 3);
    assert_eq!(backend.call_count("dep"), 0);
    assert_eq!(frontend.call_count("other"), 1);
    let x = snapshot.tasks.iter().find(|t| t.name == "x").unwrap();
    assert!(matches!(x.status, TaskStatus::Failed { .. }));
    let other = snapshot.tasks.iter().find(|t| t.name == "other").unwrap();
    assert_eq!(other.status, TaskStatus::Completed);

    let (_, failures) = harness.drain(Duration::from_millis(200)).await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, FailureKind::FatalTask);
    assert_eq!(failures[0].task_id, Some(x.id));
    harness.shutdown().await;
}

/// Test: Transient failures recover
/// Given a task that fails twice then succeeds
/// When the project runs
/// Then it is delivered with the task on its third attempt and no notice
#[tokio::test]
async fn test_transient_failures_retry_to_success() {
    let mut harness = Harness::start(
        fast_config(),
        planner(vec![PlannedTask::new("x", "flaky", "backend")]),
    );
    let provider = Arc::new(
        ScriptedProvider::new().script("x", vec![Step::Fail("timeout"), Step::Fail("timeout")]),
    );
    let worker = harness.add_worker("be-1", &["backend"], provider.clone()).await;
    harness.add_worker("reviewer", &["review"], provider.clone()).await;
    harness.add_worker("qa", &["test"], provider.clone()).await;

    let id = harness.submit("Flaky but fine").await;
    let snapshot = harness.wait_for_stage(id, Stage::Delivery).await;

    let x = snapshot.tasks.iter().find(|t| t.name == "x").unwrap();
    assert_eq!(x.status, TaskStatus::Completed);
    assert_eq!(x.attempt_count, 3);
    assert_eq!(provider.call_count("x"), 3);
    assert_eq!(harness.agent(&worker).await.state, AgentState::Idle);

    let (_, failures) = harness.drain(Duration::from_millis(100)).await;
    assert!(failures.is_empty());
    harness.shutdown().await;
}

/// Test: Cancellation abandons work
/// Given a long-running task w and a dependent y
/// When the project is cancelled while w runs
/// Then w's agent is idle again, y never runs, and one cancelled notice is sent
#[tokio::test]
async fn test_cancel_releases_agent_and_abandons_work() {
    let mut harness = Harness::start(
        fast_config(),
        planner(vec![
            PlannedTask::new("w", "takes forever", "backend"),
            PlannedTask::new("y", "after w", "backend").after(&["w"]),
        ]),
    );
    let provider = Arc::new(SlowProvider::new());
    let worker = harness.add_worker("be-1", &["backend"], provider.clone()).await;

    let id = harness.submit("Never finishes").await;
    tokio::time::timeout(crate::fixtures::WAIT, async {
        while provider.call_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("w should start");
    assert!(harness.agent(&worker).await.current_task.is_some());

    harness.orchestrator.cancel(id).await.unwrap();
    let snapshot = harness.wait_for_stage(id, Stage::Blocked).await;

    assert!(snapshot
        .tasks
        .iter()
        .all(|t| matches!(t.status, TaskStatus::Blocked { .. })));
    let status = harness.agent(&worker).await;
    assert_eq!(status.state, AgentState::Idle);
    assert!(status.current_task.is_none());

    let (_, failures) = harness.drain(Duration::from_millis(300)).await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, FailureKind::Cancelled);
    assert_eq!(provider.call_count(), 1);

    // A second cancel is a no-op on a terminal project.
    harness.orchestrator.cancel(id).await.unwrap();
    let (_, failures) = harness.drain(Duration::from_millis(100)).await;
    assert!(failures.is_empty());
    harness.shutdown().await;
}

/// Test: Lost heartbeat reassigns the task
/// Given an agent that accepts an assignment and then goes silent
/// When its heartbeat deadline passes
/// Then it is marked offline and the task completes on another agent
#[tokio::test]
async fn test_missed_heartbeat_reassigns_task() {
    let config = Config {
        heartbeat_timeout_secs: 1,
        ..fast_config()
    };
    let mut harness = Harness::start(
        config,
        planner(vec![PlannedTask::new("x", "work", "backend")]),
    );
    let provider = Arc::new(ScriptedProvider::new());
    harness.add_worker("reviewer", &["review"], provider.clone()).await;
    harness.add_worker("qa", &["test"], provider.clone()).await;

    // Registered with an inbox, but nothing ever reads it or heartbeats.
    let ghost = AgentId::new("ghost");
    let _inbox = harness.bus.register_inbox(&ghost);
    harness
        .orchestrator
        .register_agent(ghost.clone(), vec![Capability::new("backend")])
        .await
        .unwrap();

    let id = harness.submit("Ghosted").await;
    assert!(harness.agent(&ghost).await.current_task.is_some());
    let live = harness.add_worker("be-1", &["backend"], provider.clone()).await;

    let snapshot = harness.wait_for_stage(id, Stage::Delivery).await;

    let x = snapshot.tasks.iter().find(|t| t.name == "x").unwrap();
    assert_eq!(x.status, TaskStatus::Completed);
    assert_eq!(x.attempt_count, 2);
    assert_eq!(x.assigned_agent.as_ref(), Some(&live));
    assert_eq!(harness.agent(&ghost).await.state, AgentState::Offline);
    harness.shutdown().await;
}

/// Test: Capability nobody has
/// Given a task requiring a capability no registered agent offers
/// When the scheduling timeout passes
/// Then the task fails and the project is blocked with a mismatch notice
#[tokio::test]
async fn test_unmatched_capability_escalates() {
    let config = Config {
        scheduling_timeout_secs: 1,
        ..fast_config()
    };
    let mut harness = Harness::start(
        config,
        planner(vec![PlannedTask::new("train", "fit a model", "ml")]),
    );
    let provider = Arc::new(ScriptedProvider::new());
    harness.add_worker("be-1", &["backend"], provider.clone()).await;

    let id = harness.submit("Recommendation engine").await;
    let snapshot = harness.wait_for_stage(id, Stage::Blocked).await;

    assert!(provider.calls().is_empty());
    assert!(matches!(snapshot.tasks[0].status, TaskStatus::Failed { .. }));
    let (_, failures) = harness.drain(Duration::from_millis(200)).await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, FailureKind::CapabilityMismatch);
    assert!(failures[0].last_error.contains("ml"));
    harness.shutdown().await;
}

/// Test: Assignment deadline expiry
/// Given a provider that never returns and a one-attempt retry budget
/// When the assignment deadline passes
/// Then the attempt is counted and the project is blocked
#[tokio::test]
async fn test_assignment_deadline_counts_as_attempt() {
    let config = Config {
        assignment_timeout_secs: 1,
        max_retries: 1,
        ..fast_config()
    };
    let mut harness = Harness::start(
        config,
        planner(vec![PlannedTask::new("x", "stalls", "backend")]),
    );
    let provider = Arc::new(SlowProvider::new());
    let worker = harness.add_worker("be-1", &["backend"], provider.clone()).await;

    let id = harness.submit("Stalled API").await;
    let snapshot = harness.wait_for_stage(id, Stage::Blocked).await;

    let x = &snapshot.tasks[0];
    assert!(matches!(x.status, TaskStatus::Failed { .. }));
    assert_eq!(x.attempt_count, 1);
    assert_eq!(provider.call_count(), 1);

    let (_, failures) = harness.drain(Duration::from_millis(200)).await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, FailureKind::FatalTask);
    assert!(harness.agent(&worker).await.current_task.is_none());
    harness.shutdown().await;
}
