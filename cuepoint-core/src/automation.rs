//! Automations and how the queue manager finds them.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::sequence::Sequence;

/// A named sequence plus its scheduling flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Automation {
    pub id: String,
    pub sequence: Arc<Sequence>,
    /// Runs of a serialized automation go through the owner's queue and
    /// never overlap with other serialized runs there.
    #[serde(default)]
    pub serialized: bool,
}

impl Automation {
    pub fn new(id: impl Into<String>, sequence: Sequence) -> Self {
        Self {
            id: id.into(),
            sequence: Arc::new(sequence),
            serialized: false,
        }
    }

    pub fn serialized(mut self) -> Self {
        self.serialized = true;
        self
    }
}

/// Looks up automations for one domain (profiles, stream plans, ...).
pub trait AutomationResolver: Send + Sync {
    fn resolve(&self, owner_id: &str, automation_id: &str) -> Option<Arc<Automation>>;
}

/// In-memory resolver keyed by `(owner_id, automation_id)`.
#[derive(Debug, Default)]
pub struct AutomationTable {
    automations: DashMap<(String, String), Arc<Automation>>,
}

impl AutomationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. The previous definition is returned; runs already
    /// holding it finish with the old tree.
    pub fn insert(&self, owner_id: impl Into<String>, automation: Automation) -> Option<Arc<Automation>> {
        let key = (owner_id.into(), automation.id.clone());
        self.automations.insert(key, Arc::new(automation))
    }

    pub fn remove(&self, owner_id: &str, automation_id: &str) -> Option<Arc<Automation>> {
        self.automations
            .remove(&(owner_id.to_owned(), automation_id.to_owned()))
            .map(|(_, automation)| automation)
    }

    /// Drop every automation of `owner_id`, returning how many were removed.
    pub fn remove_owner(&self, owner_id: &str) -> usize {
        let before = self.automations.len();
        self.automations.retain(|(owner, _), _| owner != owner_id);
        before - self.automations.len()
    }

    pub fn len(&self) -> usize {
        self.automations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.automations.is_empty()
    }
}

impl AutomationResolver for AutomationTable {
    fn resolve(&self, owner_id: &str, automation_id: &str) -> Option<Arc<Automation>> {
        self.automations
            .get(&(owner_id.to_owned(), automation_id.to_owned()))
            .map(|entry| Arc::clone(entry.value()))
    }
}
