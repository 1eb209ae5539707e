//! Project identity, stages, and the persisted project record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a project.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub Uuid);

impl ProjectId {
    /// Create a new unique project identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ProjectId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Stages of a project, in pipeline order.
///
/// 1. Intake - Request received and validated
/// 2. Planning - Request decomposed into a task graph
/// 3. Building - Build tasks dispatched to workers
/// 4. Review - Review task checks the build output
/// 5. Testing - Test task checks the build output
/// 6. Delivery - Terminal success
///
/// `Blocked` is the terminal failure stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Intake,
    Planning,
    Building,
    Review,
    Testing,
    Delivery,
    Blocked,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Delivery | Stage::Blocked)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Intake => write!(f, "intake"),
            Stage::Planning => write!(f, "planning"),
            Stage::Building => write!(f, "building"),
            Stage::Review => write!(f, "review"),
            Stage::Testing => write!(f, "testing"),
            Stage::Delivery => write!(f, "delivery"),
            Stage::Blocked => write!(f, "blocked"),
        }
    }
}

/// Inbound request from the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRequest {
    pub request_text: String,
    /// Caller-chosen id; a fresh one is generated when absent.
    #[serde(default)]
    pub project_id: Option<ProjectId>,
}

impl ProjectRequest {
    pub fn new(request_text: &str) -> Self {
        Self {
            request_text: request_text.to_string(),
            project_id: None,
        }
    }

    pub fn with_id(mut self, id: ProjectId) -> Self {
        self.project_id = Some(id);
        self
    }
}

/// Persisted view of a project, written at every stage transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: ProjectId,
    pub name: String,
    pub stage: Stage,
    pub requirements: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectRecord {
    pub fn new(id: ProjectId, requirements: &str) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: derive_name(requirements),
            stage: Stage::Intake,
            requirements: requirements.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

const NAME_WORDS: usize = 6;

/// Short display name taken from the first words of the request.
fn derive_name(requirements: &str) -> String {
    let words: Vec<&str> = requirements.split_whitespace().collect();
    let mut name = words
        .iter()
        .take(NAME_WORDS)
        .copied()
        .collect::<Vec<_>>()
        .join(" ");
    if words.len() > NAME_WORDS {
        name.push_str("...");
    }
    name
}
