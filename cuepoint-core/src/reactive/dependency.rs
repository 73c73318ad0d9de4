//! Dependencies
//!
//! A [`Dependency`] is the record kept for one observed `(object, property)`
//! pair: the set of effects that read it during their latest run, and a
//! pending flag used to coalesce notifications.
//!
//! Dependencies are owned by the object whose property they describe (see
//! [`DependencyMap`]) and are dropped with it. Effects only hold weak
//! references back, so subscribing never keeps an object or its
//! dependencies alive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::trace;

use super::context::ReactiveContext;
use super::effect::Effect;
use super::runtime::Runtime;
use super::subscriber::{DependencyId, EffectId};

/// Prefix marking framework-internal property keys, which are never tracked.
pub const INTERNAL_KEY_PREFIX: &str = "__";

/// Whether reads and writes of `key` participate in dependency tracking.
pub fn should_track(key: &str) -> bool {
    !key.starts_with(INTERNAL_KEY_PREFIX)
}

/// Subscriber set for one `(object, property)` pair.
#[derive(Debug)]
pub struct Dependency {
    id: DependencyId,
    effects: Mutex<IndexMap<EffectId, Effect>>,
    pending: AtomicBool,
}

impl Dependency {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: DependencyId::new(),
            effects: Mutex::new(IndexMap::new()),
            pending: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> DependencyId {
        self.id
    }

    /// Record a read. Subscribes the current effect, if there is one.
    pub fn track(self: &Arc<Self>) {
        if let Some(effect) = ReactiveContext::current() {
            if effect.is_disposed() {
                return;
            }
            self.add_effect(&effect);
            effect.added(self);
        }
    }

    /// Subscribe `effect`. Returns `false` if it was already subscribed.
    pub fn add_effect(&self, effect: &Effect) -> bool {
        let mut effects = self.effects.lock();
        if effects.contains_key(&effect.id()) {
            return false;
        }
        effects.insert(effect.id(), effect.clone());
        true
    }

    pub fn remove_effect(&self, effect_id: EffectId) {
        self.effects.lock().shift_remove(&effect_id);
    }

    pub fn contains(&self, effect_id: EffectId) -> bool {
        self.effects.lock().contains_key(&effect_id)
    }

    /// Record a write.
    ///
    /// The first write marks the dependency pending and schedules one flush
    /// for the end of the current turn. Further writes before that flush
    /// has finished are absorbed by it.
    pub fn notify(self: &Arc<Self>) {
        if self.pending.swap(true, Ordering::AcqRel) {
            trace!(dependency = ?self.id, "notification coalesced");
            return;
        }
        Runtime::schedule_flush(Arc::clone(self));
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Get the number of subscribed effects.
    pub fn subscriber_count(&self) -> usize {
        self.effects.lock().len()
    }

    /// Re-run every subscribed effect, then clear the pending flag.
    ///
    /// The subscriber set is snapshotted first; effects subscribing during
    /// the flush are picked up by the next one. Failures are logged by each
    /// effect and never stop the others.
    pub(crate) async fn flush(&self) {
        let snapshot: Vec<Effect> = self.effects.lock().values().cloned().collect();
        trace!(dependency = ?self.id, effects = snapshot.len(), "flushing");

        join_all(snapshot.iter().map(Effect::rerun_logged)).await;

        self.clear_pending();
    }

    pub(crate) fn clear_pending(&self) {
        self.pending.store(false, Ordering::Release);
    }
}

/// The dependencies of one object, keyed by property.
///
/// Entries are created lazily on the first tracked access and live as long
/// as the owning object.
#[derive(Debug, Default)]
pub struct DependencyMap {
    deps: DashMap<String, Arc<Dependency>>,
}

impl DependencyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the dependency for `key`, creating it if absent.
    pub fn get_or_create(&self, key: &str) -> Arc<Dependency> {
        if let Some(dep) = self.deps.get(key) {
            return Arc::clone(dep.value());
        }
        Arc::clone(
            self.deps
                .entry(key.to_owned())
                .or_insert_with(Dependency::new)
                .value(),
        )
    }

    pub fn get(&self, key: &str) -> Option<Arc<Dependency>> {
        self.deps.get(key).map(|dep| Arc::clone(dep.value()))
    }

    pub fn remove(&self, key: &str) -> Option<Arc<Dependency>> {
        self.deps.remove(key).map(|(_, dep)| dep)
    }

    /// Track a read of `key` unless it is an internal key. Reads outside an
    /// effect allocate nothing.
    pub fn track(&self, key: &str) {
        if should_track(key) && ReactiveContext::is_active() {
            self.get_or_create(key).track();
        }
    }

    /// Notify a write of `key` unless it is an internal key.
    ///
    /// Writes to a property nobody has read do not allocate a dependency.
    pub fn notify(&self, key: &str) {
        if !should_track(key) {
            return;
        }
        if let Some(dep) = self.get(key) {
            dep.notify();
        }
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_effect() -> Effect {
        Effect::new_lazy(|| async { Ok(()) })
    }

    #[test]
    fn internal_keys_are_not_tracked() {
        assert!(should_track("active"));
        assert!(should_track("_single"));
        assert!(!should_track("__raw"));
        assert!(!should_track("__reactivity__"));
    }

    #[test]
    fn add_effect_is_idempotent() {
        let dep = Dependency::new();
        let effect = noop_effect();

        assert!(dep.add_effect(&effect));
        assert!(!dep.add_effect(&effect));
        assert!(!dep.add_effect(&effect.clone()));
        assert_eq!(dep.subscriber_count(), 1);

        dep.remove_effect(effect.id());
        assert_eq!(dep.subscriber_count(), 0);
    }

    #[test]
    fn track_without_context_is_noop() {
        let dep = Dependency::new();
        dep.track();
        assert_eq!(dep.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn track_inside_context_subscribes() {
        let dep = Dependency::new();
        let effect = noop_effect();

        let dep_clone = Arc::clone(&dep);
        ReactiveContext::scope(effect.clone(), async move {
            dep_clone.track();
            dep_clone.track();
        })
        .await;

        assert!(dep.contains(effect.id()));
        assert_eq!(dep.subscriber_count(), 1);
    }

    #[test]
    fn map_creates_lazily_and_skips_internal_keys() {
        let map = DependencyMap::new();
        assert!(map.is_empty());

        map.notify("volume");
        assert!(map.is_empty());

        let a = map.get_or_create("volume");
        let b = map.get_or_create("volume");
        assert!(Arc::ptr_eq(&a, &b));

        map.track("__raw");
        map.track("muted");
        assert_eq!(map.len(), 1);

        assert!(map.remove("volume").is_some());
        assert!(map.get("volume").is_none());
    }
}
