//! The action registry boundary.
//!
//! The engine never interprets what a leaf does. Each [`InstantAction`] is
//! handed to an [`ActionRegistry`], which maps `(plugin_id, action_id)` to
//! an invoker, resolves any templates in the config against live state and
//! runs it. The engine treats the call as an opaque async operation that
//! returns a JSON result or an [`ActionError`].
//!
//! Flow leaves go through [`ActionRegistry::invoke_flow`] instead: the
//! invoker sees every sub-flow's config and answers with the id of the
//! branch to take.
//!
//! [`ActionTable`] is an in-memory registry of [`ActionHandler`]s and
//! [`FlowHandler`]s, keyed by plugin and action id.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::ActionError;
use crate::sequence::InstantAction;

/// Everything an invoker gets for one leaf.
#[derive(Debug, Clone)]
pub struct ActionInvocation<'a> {
    pub action: &'a InstantAction,
    /// Snapshot of the run's context state at the moment the leaf started.
    pub context: Map<String, Value>,
    /// The runner's cancellation token. Long-running leaves that want to be
    /// interruptible by `abort()` must watch it; nothing else stops them.
    pub cancel: CancellationToken,
}

/// Everything a flow invoker gets to pick a branch.
#[derive(Debug, Clone)]
pub struct FlowInvocation<'a> {
    pub action: &'a InstantAction,
    /// Each sub-flow's config, keyed by sub-flow id.
    pub flows: Map<String, Value>,
    pub context: Map<String, Value>,
    pub cancel: CancellationToken,
}

/// Resolves and invokes leaf actions.
#[async_trait]
pub trait ActionRegistry: Send + Sync {
    async fn invoke(&self, invocation: ActionInvocation<'_>) -> Result<Value, ActionError>;

    /// Pick the sub-flow a flow leaf should run. `None` runs nothing.
    async fn invoke_flow(
        &self,
        invocation: FlowInvocation<'_>,
    ) -> Result<Option<String>, ActionError> {
        Err(ActionError::UnknownAction {
            plugin_id: invocation.action.plugin_id.clone(),
            action_id: invocation.action.action_id.clone(),
        })
    }
}

/// One registered action implementation.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn invoke(&self, invocation: &ActionInvocation<'_>) -> Result<Value, ActionError>;
}

/// One registered flow implementation.
#[async_trait]
pub trait FlowHandler: Send + Sync {
    async fn choose(&self, invocation: &FlowInvocation<'_>) -> Result<Option<String>, ActionError>;
}

/// Adapter turning an async closure into an [`ActionHandler`].
struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(Value, Map<String, Value>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ActionError>> + Send + 'static,
{
    async fn invoke(&self, invocation: &ActionInvocation<'_>) -> Result<Value, ActionError> {
        (self.f)(
            invocation.action.config.clone(),
            invocation.context.clone(),
            invocation.cancel.clone(),
        )
        .await
    }
}

struct FlowFnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> FlowHandler for FlowFnHandler<F>
where
    F: Fn(Value, Map<String, Value>, Map<String, Value>, CancellationToken) -> Fut
        + Send
        + Sync
        + 'static,
    Fut: Future<Output = Result<Option<String>, ActionError>> + Send + 'static,
{
    async fn choose(&self, invocation: &FlowInvocation<'_>) -> Result<Option<String>, ActionError> {
        (self.f)(
            invocation.action.config.clone(),
            invocation.flows.clone(),
            invocation.context.clone(),
            invocation.cancel.clone(),
        )
        .await
    }
}

type HandlerKey = (String, String);

fn key(plugin_id: &str, action_id: &str) -> HandlerKey {
    (plugin_id.to_owned(), action_id.to_owned())
}

fn unknown(action: &InstantAction) -> ActionError {
    ActionError::UnknownAction {
        plugin_id: action.plugin_id.clone(),
        action_id: action.action_id.clone(),
    }
}

/// Maps `(plugin_id, action_id)` to handlers.
#[derive(Default)]
pub struct ActionTable {
    handlers: DashMap<HandlerKey, Arc<dyn ActionHandler>>,
    flows: DashMap<HandlerKey, Arc<dyn FlowHandler>>,
}

impl ActionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler`, replacing any previous handler for the same key.
    pub fn register(
        &self,
        plugin_id: impl Into<String>,
        action_id: impl Into<String>,
        handler: Arc<dyn ActionHandler>,
    ) {
        self.handlers
            .insert((plugin_id.into(), action_id.into()), handler);
    }

    /// Register an async closure taking `(config, context, cancel)`.
    pub fn register_fn<F, Fut>(
        &self,
        plugin_id: impl Into<String>,
        action_id: impl Into<String>,
        f: F,
    ) where
        F: Fn(Value, Map<String, Value>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActionError>> + Send + 'static,
    {
        self.register(plugin_id, action_id, Arc::new(FnHandler { f }));
    }

    /// Register a flow `handler`, replacing any previous one for the key.
    pub fn register_flow(
        &self,
        plugin_id: impl Into<String>,
        action_id: impl Into<String>,
        handler: Arc<dyn FlowHandler>,
    ) {
        self.flows
            .insert((plugin_id.into(), action_id.into()), handler);
    }

    /// Register an async closure taking `(config, flows, context, cancel)`
    /// and returning the chosen sub-flow id.
    pub fn register_flow_fn<F, Fut>(
        &self,
        plugin_id: impl Into<String>,
        action_id: impl Into<String>,
        f: F,
    ) where
        F: Fn(Value, Map<String, Value>, Map<String, Value>, CancellationToken) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<Option<String>, ActionError>> + Send + 'static,
    {
        self.register_flow(plugin_id, action_id, Arc::new(FlowFnHandler { f }));
    }

    pub fn unregister(&self, plugin_id: &str, action_id: &str) -> bool {
        let key = key(plugin_id, action_id);
        let action = self.handlers.remove(&key).is_some();
        let flow = self.flows.remove(&key).is_some();
        action || flow
    }

    pub fn contains(&self, plugin_id: &str, action_id: &str) -> bool {
        let key = key(plugin_id, action_id);
        self.handlers.contains_key(&key) || self.flows.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.handlers.len() + self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.flows.is_empty()
    }
}

#[async_trait]
impl ActionRegistry for ActionTable {
    async fn invoke(&self, invocation: ActionInvocation<'_>) -> Result<Value, ActionError> {
        let action = invocation.action;
        let handler = self
            .handlers
            .get(&key(&action.plugin_id, &action.action_id))
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| unknown(action))?;

        handler.invoke(&invocation).await
    }

    async fn invoke_flow(
        &self,
        invocation: FlowInvocation<'_>,
    ) -> Result<Option<String>, ActionError> {
        let action = invocation.action;
        let handler = self
            .flows
            .get(&key(&action.plugin_id, &action.action_id))
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| unknown(action))?;

        handler.choose(&invocation).await
    }
}

impl std::fmt::Debug for ActionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionTable")
            .field("handlers", &self.handlers.len())
            .field("flows", &self.flows.len())
            .finish()
    }
}
