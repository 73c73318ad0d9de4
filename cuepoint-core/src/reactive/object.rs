//! Reactive objects: property-keyed tracked state.
//!
//! A [`ReactiveObject`] is a bag of named JSON properties. Every property
//! has its own [`Dependency`], created on first tracked read, so an effect
//! reading `"viewers"` is not re-run by writes to `"title"`.
//!
//! Property keys starting with `__` are internal and never tracked.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use super::dependency::DependencyMap;
use super::subscriber::ObjectId;

#[derive(Debug)]
struct ObjectInner {
    id: ObjectId,
    values: RwLock<IndexMap<String, Value>>,
    deps: DependencyMap,
}

/// Shared, tracked key/value state.
///
/// Clones are handles to the same object.
#[derive(Debug, Clone)]
pub struct ReactiveObject {
    inner: Arc<ObjectInner>,
}

impl ReactiveObject {
    pub fn new() -> Self {
        Self::from_map(IndexMap::new())
    }

    pub fn from_map(values: IndexMap<String, Value>) -> Self {
        Self {
            inner: Arc::new(ObjectInner {
                id: ObjectId::new(),
                values: RwLock::new(values),
                deps: DependencyMap::new(),
            }),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    /// Read a property, subscribing the current effect.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.deps.track(key);
        self.inner.values.read().get(key).cloned()
    }

    /// Check for a property, subscribing the current effect to it.
    pub fn has(&self, key: &str) -> bool {
        self.inner.deps.track(key);
        self.inner.values.read().contains_key(key)
    }

    pub fn get_untracked(&self, key: &str) -> Option<Value> {
        self.inner.values.read().get(key).cloned()
    }

    /// Write a property and notify its subscribers.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.inner.values.write().insert(key.clone(), value);
        self.inner.deps.notify(&key);
    }

    /// Update a property using a function of its current value.
    pub fn update<F>(&self, key: &str, f: F)
    where
        F: FnOnce(Option<&Value>) -> Value,
    {
        let new_value = {
            let values = self.inner.values.read();
            f(values.get(key))
        };
        self.set(key, new_value);
    }

    /// Delete a property.
    ///
    /// Subscribers are notified once more and the property's dependency is
    /// dropped; a later `set` starts from a fresh, empty subscriber set.
    pub fn remove(&self, key: &str) -> Option<Value> {
        let old = self.inner.values.write().shift_remove(key);
        self.inner.deps.notify(key);
        self.inner.deps.remove(key);
        old
    }

    /// Untracked copy of every property, for building invocation contexts.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.inner
            .values
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Number of properties that currently have a dependency record.
    pub fn tracked_len(&self) -> usize {
        self.inner.deps.len()
    }

    /// Subscribers of one property.
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.inner
            .deps
            .get(key)
            .map(|dep| dep.subscriber_count())
            .unwrap_or(0)
    }
}

impl Default for ReactiveObject {
    fn default() -> Self {
        Self::new()
    }
}
