//! Cuepoint Core
//!
//! The execution core of a streaming-automation engine. It decides when and
//! in what order automations run, and walks their timelines with exact
//! ordering, parallelism and cancellation guarantees.
//!
//! - Async-aware reactive state: effects that re-run when state they read
//!   changes, even when the read happened after an `.await`
//! - Action queues that serialize runs per owner or let them run freely
//! - A sequence runner for sequential steps, parallel stacks, time-offset
//!   branches and flow branching, with cooperative abort
//!
//! # Architecture
//!
//! - `reactive`: dependency tracking, effects, tracked objects and signals
//! - `evaluator`: activation predicates built on effects
//! - `queue`: the action queue manager
//! - `sequence`: sequence trees and the runner that executes them
//! - `registry`: the boundary to whatever actually performs leaf actions
//! - `automation`: automation definitions and per-domain resolvers
//!
//! A state change notifies a dependency, which re-runs an evaluator effect,
//! which asks the queue manager to run an automation, which hands its
//! sequence to a fresh runner, which invokes leaves through the registry.
//!
//! # Example
//!
//! ```rust,ignore
//! use cuepoint_core::{ActionQueueManager, ActionTable, Automation, AutomationTable,
//!     EngineConfig, InstantAction, Sequence};
//!
//! let actions = ActionTable::new();
//! actions.register_fn("obs", "scene", |config, _ctx, _cancel| async move {
//!     switch_scene(&config).await
//! });
//!
//! let automations = AutomationTable::new();
//! automations.insert(
//!     "profile-1",
//!     Automation::new("raid", Sequence::new(vec![InstantAction::new("a", "obs", "scene").into()]))
//!         .serialized(),
//! );
//!
//! let manager = ActionQueueManager::new(EngineConfig::default(), Arc::new(actions));
//! manager.register_resolver("profile", Arc::new(automations));
//! manager.queue_or_run("profile", "profile-1", "raid", Default::default())?;
//! ```

pub mod automation;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod queue;
pub mod reactive;
pub mod registry;
pub mod sequence;

pub use automation::{Automation, AutomationResolver, AutomationTable};
pub use config::EngineConfig;
pub use error::{ActionError, BoxError, BranchOutcome, EngineError};
pub use evaluator::ActivationEvaluator;
pub use queue::{ActionQueueManager, Dispatch, QueueEntry, QueueKey, RunHandle};
pub use reactive::{Effect, ReactiveObject, Signal};
pub use registry::{
    ActionHandler, ActionInvocation, ActionRegistry, ActionTable, FlowHandler, FlowInvocation,
};
pub use sequence::{
    ActionStack, Completion, FlowAction, InstantAction, Node, OffsetBranch, RunnerState, Sequence,
    SequenceDebugger, SequenceRunner, SubFlow, TimeAction,
};
pub use tokio_util::sync::CancellationToken;
