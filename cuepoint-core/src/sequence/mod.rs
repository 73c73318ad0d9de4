//! Sequences
//!
//! A [`Sequence`] is the declarative timeline of one automation: an ordered
//! list of [`Node`]s, where each node is one of
//!
//! - [`InstantAction`]: a single leaf invocation,
//! - [`ActionStack`]: leaves that start together and finish together,
//! - [`TimeAction`]: a leaf with duration plus delayed [`OffsetBranch`]es,
//!   each a nested sequence starting `offset_seconds` after the leaf,
//! - [`FlowAction`]: a leaf whose invoker picks one of its [`SubFlow`]s,
//!   which then runs inline.
//!
//! The node kind is decided once, when the tree is built or deserialized,
//! and dispatched by `match` from then on. Trees are read-only while a
//! [`SequenceRunner`] walks them.
//!
//! On the wire a node is a JSON object tagged by `"type"`:
//!
//! ```json
//! { "type": "time", "id": "b", "plugin_id": "obs", "action_id": "scene",
//!   "offsets": [ { "id": "o1", "offset_seconds": 1.0, "actions": [] } ] }
//! ```

mod debugger;
mod runner;

use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use debugger::{DebugEvent, NoopDebugger, RecordingDebugger, SequenceDebugger};
pub use runner::{Completion, RunnerState, SequenceRunner};

/// An ordered list of nodes, run strictly one after another.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    #[serde(default)]
    pub actions: Vec<Node>,
}

impl Sequence {
    pub fn new(actions: Vec<Node>) -> Self {
        Self { actions }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Number of leaf invocations in the whole tree, offsets and sub-flows
    /// included.
    pub fn leaf_count(&self) -> usize {
        count_leaves(&self.actions)
    }
}

fn count_leaves(nodes: &[Node]) -> usize {
    nodes
        .iter()
        .map(|node| match node {
            Node::Instant(_) => 1,
            Node::Stack(stack) => stack.stack.len(),
            Node::Time(time) => {
                1 + time
                    .offsets
                    .iter()
                    .map(|offset| count_leaves(&offset.actions))
                    .sum::<usize>()
            }
            Node::Flow(flow) => {
                1 + flow
                    .sub_flows
                    .iter()
                    .map(|sub| count_leaves(&sub.actions))
                    .sum::<usize>()
            }
        })
        .sum()
}

/// One step of a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Node {
    Instant(InstantAction),
    Stack(ActionStack),
    Time(TimeAction),
    Flow(FlowAction),
}

impl Node {
    pub fn id(&self) -> &str {
        match self {
            Node::Instant(action) => &action.id,
            Node::Stack(stack) => &stack.id,
            Node::Time(time) => &time.action.id,
            Node::Flow(flow) => &flow.action.id,
        }
    }
}

impl From<InstantAction> for Node {
    fn from(action: InstantAction) -> Self {
        Node::Instant(action)
    }
}

impl From<ActionStack> for Node {
    fn from(stack: ActionStack) -> Self {
        Node::Stack(stack)
    }
}

impl From<TimeAction> for Node {
    fn from(time: TimeAction) -> Self {
        Node::Time(time)
    }
}

impl From<FlowAction> for Node {
    fn from(flow: FlowAction) -> Self {
        Node::Flow(flow)
    }
}

/// A single leaf invocation, resolved through the action registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstantAction {
    pub id: String,
    pub plugin_id: String,
    pub action_id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub config: Value,
    /// Result key to context key. After a successful invocation returning
    /// an object, each mapped result value is written into the run's
    /// context under its context key.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub result_mapping: IndexMap<String, String>,
}

impl InstantAction {
    pub fn new(
        id: impl Into<String>,
        plugin_id: impl Into<String>,
        action_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            plugin_id: plugin_id.into(),
            action_id: action_id.into(),
            version: String::new(),
            config: Value::Null,
            result_mapping: IndexMap::new(),
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn map_result(mut self, result_key: impl Into<String>, context_key: impl Into<String>) -> Self {
        self.result_mapping.insert(result_key.into(), context_key.into());
        self
    }
}

/// Leaves that start together. The stack is done when every member is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStack {
    pub id: String,
    #[serde(default)]
    pub stack: Vec<InstantAction>,
}

impl ActionStack {
    pub fn new(id: impl Into<String>, stack: Vec<InstantAction>) -> Self {
        Self {
            id: id.into(),
            stack,
        }
    }
}

/// A leaf with duration, plus branches that start at fixed offsets from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeAction {
    #[serde(flatten)]
    pub action: InstantAction,
    #[serde(default)]
    pub offsets: Vec<OffsetBranch>,
}

impl TimeAction {
    pub fn new(action: InstantAction) -> Self {
        Self {
            action,
            offsets: Vec::new(),
        }
    }

    pub fn with_offset(mut self, offset: OffsetBranch) -> Self {
        self.offsets.push(offset);
        self
    }
}

/// A branching leaf. Its invoker is handed every sub-flow's config and
/// answers with the id of the one to run, or with none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowAction {
    #[serde(flatten)]
    pub action: InstantAction,
    #[serde(default)]
    pub sub_flows: Vec<SubFlow>,
}

impl FlowAction {
    pub fn new(action: InstantAction) -> Self {
        Self {
            action,
            sub_flows: Vec::new(),
        }
    }

    pub fn with_sub_flow(mut self, sub_flow: SubFlow) -> Self {
        self.sub_flows.push(sub_flow);
        self
    }

    pub fn sub_flow(&self, id: &str) -> Option<&SubFlow> {
        self.sub_flows.iter().find(|sub| sub.id == id)
    }
}

/// One candidate branch of a [`FlowAction`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubFlow {
    pub id: String,
    /// Per-branch settings the flow invoker decides on, e.g. a condition.
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub actions: Vec<Node>,
}

impl SubFlow {
    pub fn new(id: impl Into<String>, config: Value, actions: Vec<Node>) -> Self {
        Self {
            id: id.into(),
            config,
            actions,
        }
    }
}

/// A nested sequence starting `offset_seconds` after its parent leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetBranch {
    pub id: String,
    #[serde(default)]
    pub offset_seconds: f64,
    #[serde(default)]
    pub actions: Vec<Node>,
}

impl OffsetBranch {
    pub fn new(id: impl Into<String>, offset_seconds: f64, actions: Vec<Node>) -> Self {
        Self {
            id: id.into(),
            offset_seconds,
            actions,
        }
    }

    /// The start delay. Negative and NaN offsets start immediately; offsets
    /// too large for a `Duration`, infinity included, never fire on their
    /// own and only resolve when the run is aborted.
    pub fn delay(&self) -> Duration {
        if self.offset_seconds.is_nan() || self.offset_seconds <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(self.offset_seconds).unwrap_or(Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nodes_deserialize_by_tag() {
        let sequence: Sequence = serde_json::from_value(json!({
            "actions": [
                { "type": "instant", "id": "a", "plugin_id": "twitch", "action_id": "chat",
                  "config": { "message": "hi" } },
                { "type": "stack", "id": "s", "stack": [
                    { "id": "s1", "plugin_id": "sound", "action_id": "play" },
                    { "id": "s2", "plugin_id": "obs", "action_id": "source" }
                ] },
                { "type": "time", "id": "b", "plugin_id": "obs", "action_id": "scene",
                  "offsets": [
                    { "id": "o1", "offset_seconds": 1.5, "actions": [
                        { "type": "instant", "id": "c", "plugin_id": "hue", "action_id": "color" }
                    ] }
                  ] }
            ]
        }))
        .unwrap();

        assert_eq!(sequence.actions.len(), 3);
        assert!(matches!(&sequence.actions[0], Node::Instant(a) if a.config["message"] == "hi"));
        assert!(matches!(&sequence.actions[1], Node::Stack(s) if s.stack.len() == 2));
        match &sequence.actions[2] {
            Node::Time(time) => {
                assert_eq!(time.action.id, "b");
                assert_eq!(time.offsets[0].delay(), Duration::from_millis(1500));
            }
            other => panic!("expected time action, got {other:?}"),
        }
        assert_eq!(sequence.leaf_count(), 5);
    }

    #[test]
    fn node_ids() {
        let time: Node = TimeAction::new(InstantAction::new("t", "obs", "scene")).into();
        let stack: Node = ActionStack::new("s", vec![]).into();
        assert_eq!(time.id(), "t");
        assert_eq!(stack.id(), "s");
    }

    #[test]
    fn degenerate_offsets_start_immediately() {
        assert_eq!(OffsetBranch::new("o", -2.0, vec![]).delay(), Duration::ZERO);
        assert_eq!(OffsetBranch::new("o", f64::NEG_INFINITY, vec![]).delay(), Duration::ZERO);
        assert_eq!(OffsetBranch::new("o", f64::NAN, vec![]).delay(), Duration::ZERO);
        assert_eq!(OffsetBranch::new("o", 0.0, vec![]).delay(), Duration::ZERO);
        assert_eq!(
            OffsetBranch::new("o", 0.25, vec![]).delay(),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn oversized_offsets_never_fire() {
        assert_eq!(OffsetBranch::new("o", 1e30, vec![]).delay(), Duration::MAX);
        assert_eq!(OffsetBranch::new("o", f64::INFINITY, vec![]).delay(), Duration::MAX);
        assert_eq!(OffsetBranch::new("o", f64::MAX, vec![]).delay(), Duration::MAX);
    }

    #[test]
    fn flow_nodes_deserialize_with_sub_flows() {
        let node: Node = serde_json::from_value(json!({
            "type": "flow", "id": "f", "plugin_id": "logic", "action_id": "if",
            "config": { "value": 3 },
            "sub_flows": [
                { "id": "big", "config": { "gt": 10 }, "actions": [
                    { "type": "instant", "id": "x", "plugin_id": "obs", "action_id": "scene" }
                ] },
                { "id": "small", "actions": [] }
            ]
        }))
        .unwrap();

        let Node::Flow(flow) = &node else {
            panic!("expected flow action, got {node:?}");
        };
        assert_eq!(node.id(), "f");
        assert_eq!(flow.sub_flows.len(), 2);
        assert_eq!(flow.sub_flow("big").unwrap().config["gt"], 10);
        assert_eq!(flow.sub_flow("small").unwrap().config, Value::Null);
        assert!(flow.sub_flow("missing").is_none());
        assert_eq!(Sequence::new(vec![node.clone()]).leaf_count(), 2);
    }

    #[test]
    fn unknown_node_type_is_rejected() {
        let result: Result<Node, _> =
            serde_json::from_value(json!({ "type": "loop", "id": "x" }));
        assert!(result.is_err());
    }
}
