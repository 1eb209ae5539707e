//! Project stage machine with transition validation.
//!
//! `ProjectState` wraps a `ProjectRecord` and enforces the stage ordering:
//!
//! Intake -> Planning -> Building -> Review -> Testing -> Delivery
//!
//! Review and Testing may loop back to Building. Any non-terminal stage may
//! move to Blocked.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::{ProjectRecord, Stage};

/// A record of a stage transition with timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageHistoryEntry {
    /// The stage that was entered.
    pub stage: Stage,
    /// When this stage was entered.
    pub entered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectState {
    record: ProjectRecord,
    stage_history: Vec<StageHistoryEntry>,
    /// How many times the project has looped back into Building.
    remediation_loops: u32,
}

impl ProjectState {
    /// Create a new ProjectState from an existing record.
    ///
    /// The record's current stage is recorded as the first history entry.
    pub fn new(record: ProjectRecord) -> Self {
        let initial = record.stage;
        Self {
            record,
            stage_history: vec![StageHistoryEntry {
                stage: initial,
                entered_at: Utc::now(),
            }],
            remediation_loops: 0,
        }
    }

    /// Check if a transition to the target stage is valid from the current stage.
    pub fn can_transition(&self, target: Stage) -> bool {
        let current = self.record.stage;
        if target == Stage::Blocked {
            return !current.is_terminal();
        }
        matches!(
            (current, target),
            (Stage::Intake, Stage::Planning)
                | (Stage::Planning, Stage::Building)
                | (Stage::Building, Stage::Review)
                | (Stage::Review, Stage::Testing)
                | (Stage::Review, Stage::Building)
                | (Stage::Testing, Stage::Delivery)
                | (Stage::Testing, Stage::Building)
        )
    }

    /// Attempt to move the project to a new stage.
    ///
    /// A move back into Building from Review or Testing counts as a
    /// remediation loop.
    pub fn transition(&mut self, target: Stage) -> Result<()> {
        if !self.can_transition(target) {
            return Err(Error::InvalidStageTransition {
                from: self.record.stage.to_string(),
                to: target.to_string(),
            });
        }

        if target == Stage::Building
            && matches!(self.record.stage, Stage::Review | Stage::Testing)
        {
            self.remediation_loops += 1;
        }

        let now = Utc::now();
        self.record.stage = target;
        self.record.updated_at = now;
        self.stage_history.push(StageHistoryEntry {
            stage: target,
            entered_at: now,
        });

        Ok(())
    }

    pub fn stage(&self) -> Stage {
        self.record.stage
    }

    pub fn is_terminal(&self) -> bool {
        self.record.stage.is_terminal()
    }

    pub fn stage_history(&self) -> &[StageHistoryEntry] {
        &self.stage_history
    }

    pub fn remediation_loops(&self) -> u32 {
        self.remediation_loops
    }

    pub fn record(&self) -> &ProjectRecord {
        &self.record
    }
}
