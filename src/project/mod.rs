//! Project types and the stage state machine.

mod state;
mod types;

pub use state::{ProjectState, StageHistoryEntry};
pub use types::{ProjectId, ProjectRecord, ProjectRequest, Stage};
