//! Core domain models for forge orchestration.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestration system: tasks and the per-project dependency graph.

pub mod dag;
pub mod task;

pub use dag::TaskGraph;
pub use task::{Capability, Finding, Priority, Task, TaskId, TaskKind, TaskResult, TaskStatus};
