//! Shared handle for background actors.
//!
//! Each actor is an independent tokio task driven by a `select!` loop over
//! its channels, its timers and a cancellation token:
//! - The orchestrator run loop (`Orchestrator::spawn`)
//! - One worker loop per agent (`Worker::spawn`)

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Handle to a running actor, used for graceful shutdown.
pub struct ActorHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ActorHandle {
    /// Create a new actor handle with a cancellation token.
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel, task: None }
    }

    /// Attach the actor's task so `join` can wait for it.
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    /// Signal the actor to shut down gracefully.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Check if shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that is cancelled together with this actor.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Shut the actor down and wait for its loop to exit.
    pub async fn join(mut self) -> Result<()> {
        self.cancel.cancel();
        match self.task.take() {
            Some(task) => task.await.map_err(|e| Error::TaskJoin(e.to_string())),
            None => Ok(()),
        }
    }
}
