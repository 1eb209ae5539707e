//! Request decomposition.
//!
//! A `Planner` turns a validated request into a `Plan`: named tasks with
//! capabilities, priorities and dependencies expressed by key. The
//! orchestrator converts the plan into a task graph batch, which is where
//! cycles are rejected.

use crate::core::task::{Capability, Priority, Task, TaskId};
use crate::error::{Error, Result};
use std::collections::HashMap;

/// One task in a plan, addressed by `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTask {
    pub key: String,
    pub description: String,
    pub capability: Capability,
    pub priority: Priority,
    pub depends_on: Vec<String>,
}

impl PlannedTask {
    pub fn new(key: &str, description: &str, capability: &str) -> Self {
        Self {
            key: key.to_string(),
            description: description.to_string(),
            capability: Capability::new(capability),
            priority: Priority::default(),
            depends_on: Vec::new(),
        }
    }

    pub fn after(mut self, keys: &[&str]) -> Self {
        self.depends_on = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub tasks: Vec<PlannedTask>,
}

impl Plan {
    pub fn new(tasks: Vec<PlannedTask>) -> Self {
        Self { tasks }
    }

    /// Assign fresh task ids and resolve dependency keys.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an empty plan, a duplicate key, or a
    /// dependency on an unknown key. Cycles are left to the task graph.
    pub fn into_batch(self) -> Result<Vec<(Task, Vec<TaskId>)>> {
        if self.tasks.is_empty() {
            return Err(Error::Validation("plan contains no tasks".to_string()));
        }

        let mut ids: HashMap<String, TaskId> = HashMap::new();
        for planned in &self.tasks {
            if ids.insert(planned.key.clone(), TaskId::new()).is_some() {
                return Err(Error::Validation(format!(
                    "duplicate task key '{}' in plan",
                    planned.key
                )));
            }
        }

        self.tasks
            .into_iter()
            .map(|planned| {
                let deps = planned
                    .depends_on
                    .iter()
                    .map(|key| {
                        ids.get(key).copied().ok_or_else(|| {
                            Error::Validation(format!(
                                "task '{}' depends on unknown task '{}'",
                                planned.key, key
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                let mut task = Task::new(&planned.key, &planned.description, planned.capability)
                    .with_priority(planned.priority);
                task.id = ids[&planned.key];
                Ok((task, deps))
            })
            .collect()
    }
}

pub trait Planner: Send {
    fn plan(&self, request: &str) -> Result<Plan>;
}

/// Returns the same plan for every request.
#[derive(Debug, Clone)]
pub struct StaticPlanner {
    plan: Plan,
}

impl StaticPlanner {
    pub fn new(plan: Plan) -> Self {
        Self { plan }
    }
}

impl Planner for StaticPlanner {
    fn plan(&self, _request: &str) -> Result<Plan> {
        Ok(self.plan.clone())
    }
}

const BACKEND_KEYWORDS: &[&str] = &[
    "api", "backend", "database", "login", "auth", "account", "server", "form", "checkout",
];

/// Keyword-driven decomposition into a small website build.
///
/// Every request gets a design task, page markup, styles and scripts.
/// Requests that mention server-side concerns also get an API task that
/// the scripts depend on.
#[derive(Debug, Clone, Default)]
pub struct TemplatePlanner;

impl TemplatePlanner {
    pub fn new() -> Self {
        Self
    }

    fn needs_backend(request: &str) -> bool {
        let lower = request.to_lowercase();
        lower
            .split(|c: char| !c.is_alphanumeric())
            .any(|word| BACKEND_KEYWORDS.contains(&word))
    }
}

impl Planner for TemplatePlanner {
    fn plan(&self, request: &str) -> Result<Plan> {
        let summary = request.trim();
        let mut tasks = vec![
            PlannedTask::new(
                "design",
                &format!("Design layout and visual style for: {}", summary),
                "design",
            )
            .with_priority(Priority::High),
            PlannedTask::new("markup", "Create the page structure", "frontend").after(&["design"]),
            PlannedTask::new("styles", "Create the stylesheet", "frontend").after(&["markup"]),
        ];

        if Self::needs_backend(request) {
            tasks.push(
                PlannedTask::new("api", "Implement the server-side API", "backend")
                    .after(&["design"]),
            );
            tasks.push(
                PlannedTask::new("scripts", "Wire page behaviour to the API", "frontend")
                    .after(&["markup", "api"]),
            );
        } else {
            tasks.push(
                PlannedTask::new("scripts", "Add page behaviour", "frontend")
                    .after(&["markup"])
                    .with_priority(Priority::Low),
            );
        }

        Ok(Plan::new(tasks))
    }
}
