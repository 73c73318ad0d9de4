//! Sequence Runner
//!
//! Drives one [`Sequence`] to completion or cancellation. Each runner owns a
//! single [`CancellationToken`], created with it and never reused; the token
//! is threaded explicitly through every recursive call and handed to each
//! leaf invocation.
//!
//! Failure policy per node kind:
//!
//! - a plain action list is fail-fast: the first failing node ends it and
//!   the error propagates to the parent,
//! - an [`ActionStack`] isolates its members; failures are logged and
//!   returned as per-member [`BranchOutcome`]s,
//! - a [`TimeAction`] joins its leaf with all of its offset branches.
//!   Branch failures are recorded like stack members. The leaf's own failure
//!   propagates once every branch has resolved,
//! - a [`FlowAction`] asks the registry which sub-flow to take and runs it
//!   like a plain list. A failed choice or a failed sub-flow propagates.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::debugger::{NoopDebugger, SequenceDebugger};
use super::{ActionStack, FlowAction, InstantAction, Node, OffsetBranch, Sequence, TimeAction};
use crate::error::{ActionError, BranchOutcome, EngineError};
use crate::registry::{ActionInvocation, ActionRegistry, FlowInvocation};

static NOOP: NoopDebugger = NoopDebugger;

/// Lifecycle of one runner. The three end states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunnerState {
    Created,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl RunnerState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunnerState::Completed | RunnerState::Failed | RunnerState::Aborted
        )
    }
}

/// How a successful run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Completed,
    Aborted,
}

pub struct SequenceRunner {
    sequence: Arc<Sequence>,
    registry: Arc<dyn ActionRegistry>,
    context: Mutex<Map<String, Value>>,
    debugger: Option<Arc<dyn SequenceDebugger>>,
    cancel: CancellationToken,
    state: Mutex<RunnerState>,
}

impl SequenceRunner {
    pub fn new(
        sequence: Arc<Sequence>,
        registry: Arc<dyn ActionRegistry>,
        context: Map<String, Value>,
    ) -> Self {
        Self {
            sequence,
            registry,
            context: Mutex::new(context),
            debugger: None,
            cancel: CancellationToken::new(),
            state: Mutex::new(RunnerState::Created),
        }
    }

    pub fn with_debugger(mut self, debugger: Arc<dyn SequenceDebugger>) -> Self {
        self.debugger = Some(debugger);
        self
    }

    /// Fire the cancellation scope.
    ///
    /// Pending offset branches resolve as cancelled without running, and no
    /// further node starts. Leaves already in flight keep running unless
    /// their invoker watches the token.
    pub fn abort(&self) {
        if !self.cancel.is_cancelled() {
            debug!(state = ?self.state(), "aborting sequence runner");
        }
        self.cancel.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn state(&self) -> RunnerState {
        *self.state.lock()
    }

    /// A child of the runner's token, for callers that want to observe it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Current context state, including merged result mappings.
    pub fn context(&self) -> Map<String, Value> {
        self.context.lock().clone()
    }

    pub fn sequence(&self) -> &Arc<Sequence> {
        &self.sequence
    }

    fn debugger(&self) -> &dyn SequenceDebugger {
        self.debugger.as_deref().unwrap_or(&NOOP)
    }

    /// Execute the root sequence. A runner runs exactly once.
    #[instrument(name = "sequence_run", skip(self), fields(leaves = self.sequence.leaf_count()))]
    pub async fn run(&self) -> Result<Completion, EngineError> {
        {
            let mut state = self.state.lock();
            if *state != RunnerState::Created {
                return Err(EngineError::AlreadyStarted);
            }
            *state = RunnerState::Running;
        }

        self.debugger().sequence_started();
        let result = self.run_sequence(&self.sequence.actions, &self.cancel).await;
        self.debugger().sequence_ended();

        let (state, result) = match result {
            _ if self.cancel.is_cancelled() => (RunnerState::Aborted, Ok(Completion::Aborted)),
            Ok(completion) => (RunnerState::Completed, Ok(completion)),
            Err(err) => (RunnerState::Failed, Err(err)),
        };
        *self.state.lock() = state;
        debug!(?state, "sequence run finished");
        result
    }

    /// Run `nodes` strictly in order, each to full completion before the
    /// next starts.
    fn run_sequence<'a>(
        &'a self,
        nodes: &'a [Node],
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Completion, EngineError>> {
        async move {
            for node in nodes {
                if cancel.is_cancelled() {
                    return Ok(Completion::Aborted);
                }
                self.run_node(node, cancel).await?;
            }
            Ok(Completion::Completed)
        }
        .boxed()
    }

    async fn run_node(&self, node: &Node, cancel: &CancellationToken) -> Result<(), EngineError> {
        match node {
            Node::Instant(action) => self.run_action_base(action, cancel).await.map(drop),
            Node::Stack(stack) => {
                self.run_action_stack(stack, cancel).await;
                Ok(())
            }
            Node::Time(time) => self.run_time_action(time, cancel).await,
            Node::Flow(flow) => self.run_flow_action(flow, cancel).await,
        }
    }

    /// Start every member together and wait for all of them. Never fails.
    async fn run_action_stack(
        &self,
        stack: &ActionStack,
        cancel: &CancellationToken,
    ) -> Vec<BranchOutcome> {
        let members = stack.stack.iter().map(|action| async move {
            match self.run_action_base(action, cancel).await {
                Ok(_) => BranchOutcome::Completed,
                Err(err) if err.is_cancelled() => BranchOutcome::Cancelled,
                Err(err) => {
                    warn!(stack = %stack.id, member = %action.id, error = %err, "stack member failed");
                    BranchOutcome::Failed(err)
                }
            }
        });
        join_all(members).await
    }

    /// The leaf and every offset branch run concurrently; the node is done
    /// when all of them are.
    async fn run_time_action(
        &self,
        time: &TimeAction,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let leaf = self.run_action_base(&time.action, cancel);
        let branches = join_all(
            time.offsets
                .iter()
                .map(|offset| self.run_offset(&time.action.id, offset, cancel)),
        );

        let (leaf, outcomes) = tokio::join!(leaf, branches);
        for (offset, outcome) in time.offsets.iter().zip(&outcomes) {
            if let BranchOutcome::Failed(err) = outcome {
                warn!(action = %time.action.id, offset = %offset.id, error = %err, "offset branch failed");
            }
        }
        leaf.map(drop)
    }

    /// A delayed branch. If the token fires before the delay elapses the
    /// body never runs.
    async fn run_offset(
        &self,
        parent: &str,
        offset: &OffsetBranch,
        cancel: &CancellationToken,
    ) -> BranchOutcome {
        let delay = offset.delay();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(parent, offset = %offset.id, "offset branch cancelled before start");
                BranchOutcome::Cancelled
            }
            _ = tokio::time::sleep(delay) => {
                match self.run_sequence(&offset.actions, cancel).await {
                    Ok(Completion::Completed) => BranchOutcome::Completed,
                    Ok(Completion::Aborted) => BranchOutcome::Cancelled,
                    Err(err) if err.is_cancelled() => BranchOutcome::Cancelled,
                    Err(err) => BranchOutcome::Failed(err),
                }
            }
        }
    }

    /// Let the registry pick a sub-flow, then run it inline. The marks
    /// bracket both the choice and the chosen sub-flow.
    async fn run_flow_action(
        &self,
        flow: &FlowAction,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let action = &flow.action;
        let debugger = self.debugger();
        debugger.mark_start(&action.id);

        let invocation = FlowInvocation {
            action,
            flows: flow
                .sub_flows
                .iter()
                .map(|sub| (sub.id.clone(), sub.config.clone()))
                .collect(),
            context: self.context(),
            cancel: cancel.clone(),
        };
        let chosen = AssertUnwindSafe(self.registry.invoke_flow(invocation))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(ActionError::Failed("flow invoker panicked".into())));

        let result = match chosen {
            Ok(chosen) => {
                debugger.log_result(&action.id, &Value::from(chosen.clone()));
                match chosen.as_deref().and_then(|id| flow.sub_flow(id)) {
                    Some(sub) => {
                        debug!(action = %action.id, sub_flow = %sub.id, "running sub-flow");
                        self.run_sequence(&sub.actions, cancel).await.map(drop)
                    }
                    None => {
                        debug!(action = %action.id, ?chosen, "no sub-flow to run");
                        Ok(())
                    }
                }
            }
            Err(source) => {
                let err = leaf_error(action, source);
                warn!(action = %action.id, error = %err, "flow invocation failed");
                debugger.log_error(&action.id, &err);
                Err(err)
            }
        };

        debugger.mark_end(&action.id);
        result
    }

    /// Invoke one leaf through the registry, bracketed by debug marks.
    async fn run_action_base(
        &self,
        action: &InstantAction,
        cancel: &CancellationToken,
    ) -> Result<Value, EngineError> {
        let debugger = self.debugger();
        debugger.mark_start(&action.id);

        let invocation = ActionInvocation {
            action,
            context: self.context(),
            cancel: cancel.clone(),
        };
        let outcome = AssertUnwindSafe(self.registry.invoke(invocation))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(ActionError::Failed("action invoker panicked".into())));

        let result = match outcome {
            Ok(value) => {
                debugger.log_result(&action.id, &value);
                self.apply_result_mapping(action, &value);
                Ok(value)
            }
            Err(source) => {
                let err = leaf_error(action, source);
                if err.is_cancelled() {
                    debug!(action = %action.id, "leaf observed cancellation");
                } else {
                    warn!(action = %action.id, error = %err, "leaf invocation failed");
                }
                debugger.log_error(&action.id, &err);
                Err(err)
            }
        };

        debugger.mark_end(&action.id);
        result
    }

    fn apply_result_mapping(&self, action: &InstantAction, result: &Value) {
        if action.result_mapping.is_empty() {
            return;
        }
        let Some(fields) = result.as_object() else {
            return;
        };

        let mut context = self.context.lock();
        for (result_key, context_key) in &action.result_mapping {
            if let Some(value) = fields.get(result_key) {
                context.insert(context_key.clone(), value.clone());
            }
        }
    }
}

fn leaf_error(action: &InstantAction, source: ActionError) -> EngineError {
    EngineError::LeafInvocation {
        action_id: action.id.clone(),
        plugin_id: action.plugin_id.clone(),
        action: action.action_id.clone(),
        source,
    }
}

impl std::fmt::Debug for SequenceRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceRunner")
            .field("state", &self.state())
            .field("aborted", &self.is_aborted())
            .field("leaves", &self.sequence.leaf_count())
            .finish()
    }
}
