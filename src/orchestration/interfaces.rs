//! Collaborator contracts at the edge of the orchestration core.
//!
//! - `Gateway` receives status events and failure notices for observers.
//! - `CapabilityProvider` does the actual work for a worker.
//! - `ArtifactStore` holds files produced by tasks.
//! - `ProjectStore` persists project records at stage transitions.

use crate::agent::{AgentId, AgentStatus};
use crate::core::task::{Finding, Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::project::{ProjectId, ProjectRecord, Stage};
use crate::util::{blocking, blocking_with_timeout, read_json, read_json_dir, write_json_atomic};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

// ========== Gateway ==========

/// One task status change inside a `StatusEvent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub agent_id: Option<AgentId>,
    pub attempt_count: u32,
}

impl From<&Task> for TaskEvent {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            name: task.name.clone(),
            status: task.status.clone(),
            agent_id: task.assigned_agent.clone(),
            attempt_count: task.attempt_count,
        }
    }
}

/// Emitted whenever a project's stage, task statuses, or agents change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub project_id: ProjectId,
    pub stage: Stage,
    pub agent_statuses: Vec<AgentStatus>,
    pub task_events: Vec<TaskEvent>,
}

/// Why a project ended up blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DependencyCycle,
    FatalTask,
    CapabilityMismatch,
    RemediationLimit,
    Cancelled,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::DependencyCycle => write!(f, "dependency cycle"),
            FailureKind::FatalTask => write!(f, "fatal task failure"),
            FailureKind::CapabilityMismatch => write!(f, "capability mismatch"),
            FailureKind::RemediationLimit => write!(f, "remediation limit reached"),
            FailureKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// User-visible failure, sent to the gateway once per project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureNotice {
    pub project_id: ProjectId,
    pub kind: FailureKind,
    pub task_id: Option<TaskId>,
    pub attempts: u32,
    pub last_error: String,
}

impl FailureNotice {
    /// One-line diagnostic.
    pub fn summary(&self) -> String {
        match self.task_id {
            Some(task) => format!(
                "project {} blocked ({}): task {} after {} attempt(s): {}",
                self.project_id.short(),
                self.kind,
                task.short(),
                self.attempts,
                self.last_error
            ),
            None => format!(
                "project {} blocked ({}): {}",
                self.project_id.short(),
                self.kind,
                self.last_error
            ),
        }
    }
}

/// Outbound side of the gateway.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn status(&self, event: StatusEvent);
    async fn failure(&self, notice: FailureNotice);
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum GatewayEvent {
    Status(StatusEvent),
    Failure(FailureNotice),
}

/// Gateway that forwards every event into a channel.
pub struct ChannelGateway {
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

impl ChannelGateway {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Gateway for ChannelGateway {
    async fn status(&self, event: StatusEvent) {
        let _ = self.tx.send(GatewayEvent::Status(event));
    }

    async fn failure(&self, notice: FailureNotice) {
        let _ = self.tx.send(GatewayEvent::Failure(notice));
    }
}

// ========== Capability provider ==========

/// A file produced by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: String,
    pub content: String,
}

impl Artifact {
    pub fn new(path: &str, content: &str) -> Self {
        Self {
            path: path.to_string(),
            content: content.to_string(),
        }
    }
}

/// Raw provider output. The worker stores `files` and reports only paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderOutput {
    pub summary: String,
    #[serde(default)]
    pub files: Vec<Artifact>,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl ProviderOutput {
    pub fn new(summary: &str) -> Self {
        Self {
            summary: summary.to_string(),
            ..Default::default()
        }
    }

    pub fn with_file(mut self, path: &str, content: &str) -> Self {
        self.files.push(Artifact::new(path, content));
        self
    }

    pub fn with_finding(mut self, finding: Finding) -> Self {
        self.findings.push(finding);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("provider failed: {0}")]
    Failed(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider returned invalid output: {0}")]
    InvalidOutput(String),
}

/// Opaque, possibly slow, externally owned operation that performs a task.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    async fn invoke(&self, task: &Task) -> std::result::Result<ProviderOutput, ProviderError>;
}

// ========== Artifact store ==========

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn write(&self, project_id: ProjectId, path: &str, content: &str) -> Result<()>;
    async fn read(&self, project_id: ProjectId, path: &str) -> Result<Option<String>>;
    async fn list(&self, project_id: ProjectId) -> Result<Vec<String>>;
}

/// Reject absolute paths and any `..` component.
pub fn validate_artifact_path(path: &str) -> Result<()> {
    let p = Path::new(path);
    let escapes = p
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if path.trim().is_empty() || escapes {
        return Err(Error::Validation(format!("invalid artifact path '{}'", path)));
    }
    Ok(())
}

#[derive(Default)]
pub struct MemoryArtifactStore {
    files: RwLock<HashMap<ProjectId, BTreeMap<String, String>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn write(&self, project_id: ProjectId, path: &str, content: &str) -> Result<()> {
        validate_artifact_path(path)?;
        self.files
            .write()
            .await
            .entry(project_id)
            .or_default()
            .insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn read(&self, project_id: ProjectId, path: &str) -> Result<Option<String>> {
        Ok(self
            .files
            .read()
            .await
            .get(&project_id)
            .and_then(|files| files.get(path).cloned()))
    }

    async fn list(&self, project_id: ProjectId) -> Result<Vec<String>> {
        Ok(self
            .files
            .read()
            .await
            .get(&project_id)
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default())
    }
}

// ========== Project store ==========

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn save(&self, record: &ProjectRecord) -> Result<()>;
    async fn load(&self, id: ProjectId) -> Result<Option<ProjectRecord>>;
    async fn list(&self) -> Result<Vec<ProjectRecord>>;
}

#[derive(Default)]
pub struct MemoryProjectStore {
    records: RwLock<HashMap<ProjectId, ProjectRecord>>,
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn save(&self, record: &ProjectRecord) -> Result<()> {
        self.records.write().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn load(&self, id: ProjectId) -> Result<Option<ProjectRecord>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<ProjectRecord>> {
        let mut records: Vec<ProjectRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

const STORE_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// One pretty-printed JSON file per project under `dir`.
pub struct JsonProjectStore {
    dir: PathBuf,
    io_timeout: Duration,
}

impl JsonProjectStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            io_timeout: STORE_IO_TIMEOUT,
        }
    }

    /// Bound on a single record read or write.
    pub fn with_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    fn path_for(&self, id: ProjectId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

#[async_trait]
impl ProjectStore for JsonProjectStore {
    async fn save(&self, record: &ProjectRecord) -> Result<()> {
        let path = self.path_for(record.id);
        let owned = record.clone();
        blocking_with_timeout(self.io_timeout, move || write_json_atomic(&path, &owned)).await?;
        debug!("Saved project record {}", record.id.short());
        Ok(())
    }

    async fn load(&self, id: ProjectId) -> Result<Option<ProjectRecord>> {
        let path = self.path_for(id);
        blocking_with_timeout(self.io_timeout, move || read_json(&path)).await
    }

    async fn list(&self) -> Result<Vec<ProjectRecord>> {
        let dir = self.dir.clone();
        let mut records: Vec<ProjectRecord> = blocking(move || read_json_dir(&dir)).await?;
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}
