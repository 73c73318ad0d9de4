//! Action Queues
//!
//! A queue is a serialization domain identified by [`QueueKey`]. Entries on
//! the same queue run strictly one at a time in enqueue order; runs on
//! different queues, and runs of unserialized automations, have no ordering
//! relationship with each other.
//!
//! The engine does not lock application state. Two automations that touch
//! the same external state are only mutually excluded when they are routed
//! through the same queue.

mod manager;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::automation::Automation;
use crate::error::EngineError;
use crate::sequence::{Completion, SequenceRunner};

pub use manager::ActionQueueManager;

/// `(domain, owner_id)`, e.g. `("profile", "<profile id>")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueKey {
    pub domain: String,
    pub owner_id: String,
}

impl QueueKey {
    pub fn new(domain: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            owner_id: owner_id.into(),
        }
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.owner_id)
    }
}

/// One requested run waiting on (or running at the head of) a queue.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub(crate) id: u64,
    pub automation_id: String,
    pub automation: Arc<Automation>,
    pub context: Map<String, Value>,
}

/// What `queue_or_run` did with a request.
#[derive(Debug)]
pub enum Dispatch {
    /// Appended to a serialized queue. `position` 0 means it is next.
    Queued { queue: QueueKey, position: usize },
    /// Started immediately, concurrently with everything else.
    Started(RunHandle),
}

impl Dispatch {
    pub fn is_queued(&self) -> bool {
        matches!(self, Dispatch::Queued { .. })
    }

    pub fn into_handle(self) -> Option<RunHandle> {
        match self {
            Dispatch::Started(handle) => Some(handle),
            Dispatch::Queued { .. } => None,
        }
    }
}

/// A spawned, unqueued run.
#[derive(Debug)]
pub struct RunHandle {
    runner: Arc<SequenceRunner>,
    handle: JoinHandle<Result<Completion, EngineError>>,
}

impl RunHandle {
    pub(crate) fn new(
        runner: Arc<SequenceRunner>,
        handle: JoinHandle<Result<Completion, EngineError>>,
    ) -> Self {
        Self { runner, handle }
    }

    pub fn runner(&self) -> &Arc<SequenceRunner> {
        &self.runner
    }

    /// Cooperative abort of the run; see [`SequenceRunner::abort`].
    pub fn abort(&self) {
        self.runner.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn wait(self) -> Result<Completion, EngineError> {
        self.handle
            .await
            .map_err(|err| EngineError::Join(err.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display() {
        let key = QueueKey::new("profile", "p1");
        assert_eq!(key.to_string(), "profile/p1");
        assert_eq!(key, QueueKey::new("profile".to_string(), "p1"));
        assert_ne!(key, QueueKey::new("plan", "p1"));
    }
}
