//! Error types shared by the reactive layer, the queue manager and the
//! sequence runner.

use thiserror::Error;

use crate::queue::QueueKey;

/// Boxed error returned by user-supplied effect functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by a leaf action invoker.
#[derive(Debug, Clone, Error)]
pub enum ActionError {
    /// No invoker is registered for `(plugin_id, action_id)`.
    #[error("unknown action {plugin_id}:{action_id}")]
    UnknownAction {
        plugin_id: String,
        action_id: String,
    },

    /// The action's config could not be resolved against live state.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The invoker ran and reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The invoker observed the runner's cancellation token and gave up.
    #[error("action cancelled")]
    Cancelled,
}

/// Errors produced by the execution engine.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// A leaf's external invocation failed.
    #[error("action '{action_id}' ({plugin_id}:{action}) failed: {source}")]
    LeafInvocation {
        action_id: String,
        plugin_id: String,
        action: String,
        #[source]
        source: ActionError,
    },

    /// A pending offset branch was cancelled by `abort()`.
    #[error("cancelled")]
    Cancelled,

    /// A run failed while being drained from a serialized queue.
    #[error("queued run of '{automation_id}' on {queue} failed: {source}")]
    QueueDrain {
        queue: QueueKey,
        automation_id: String,
        #[source]
        source: Box<EngineError>,
    },

    /// The queue already holds the configured maximum of pending entries.
    #[error("queue {queue} is full ({max} pending entries)")]
    QueueFull { queue: QueueKey, max: usize },

    /// No resolver is registered for the requested domain.
    #[error("no automation resolver registered for domain '{0}'")]
    UnknownDomain(String),

    /// The domain's resolver does not know the automation.
    #[error("unknown automation '{automation_id}' for {domain}/{owner_id}")]
    UnknownAutomation {
        domain: String,
        owner_id: String,
        automation_id: String,
    },

    /// A run was requested from a thread with no tokio runtime to spawn on.
    #[error("no tokio runtime available to start the run")]
    NoRuntime,

    /// `run()` was called on a runner that has already been started.
    #[error("sequence runner already started")]
    AlreadyStarted,

    /// The run task itself died (panicked) before reporting a result.
    #[error("run task failed: {0}")]
    Join(String),
}

impl EngineError {
    /// Whether this error represents deliberate cancellation rather than a
    /// failure.
    pub fn is_cancelled(&self) -> bool {
        match self {
            EngineError::Cancelled => true,
            EngineError::LeafInvocation { source, .. } => matches!(source, ActionError::Cancelled),
            EngineError::QueueDrain { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

/// How one concurrently started branch (stack member or offset branch)
/// resolved.
#[derive(Debug, Clone)]
pub enum BranchOutcome {
    Completed,
    Failed(EngineError),
    Cancelled,
}

impl BranchOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, BranchOutcome::Completed)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BranchOutcome::Cancelled)
    }
}
