//! Signal Implementation
//!
//! A Signal is a single tracked value: an object with exactly one property.
//! Reading it inside an effect subscribes the effect; writing it notifies.
//!
//! Signals are cheap to clone; clones share the value and the dependency.

use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::RwLock;

use super::dependency::Dependency;

/// A reactive value of type `T`.
///
/// # Example
///
/// ```rust,ignore
/// let active = Signal::new(false);
///
/// let watcher = Effect::new({
///     let active = active.clone();
///     move || {
///         let active = active.clone();
///         async move {
///             println!("active: {}", active.get());
///             Ok(())
///         }
///     }
/// })
/// .await;
///
/// active.set(true); // watcher re-runs after this turn
/// ```
pub struct Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    value: Arc<RwLock<T>>,
    dependency: Arc<Dependency>,
}

impl<T> Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new signal with the given initial value.
    pub fn new(value: T) -> Self {
        Self {
            value: Arc::new(RwLock::new(value)),
            dependency: Dependency::new(),
        }
    }

    /// Get the current value, subscribing the current effect if any.
    pub fn get(&self) -> T {
        self.dependency.track();
        self.value.read().clone()
    }

    /// Get the current value without tracking.
    pub fn get_untracked(&self) -> T {
        self.value.read().clone()
    }

    /// Set a new value and notify subscribers.
    pub fn set(&self, value: T) {
        *self.value.write() = value;
        self.dependency.notify();
    }

    /// Update the value using a function of the current value.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let new_value = {
            let guard = self.value.read();
            f(&guard)
        };
        self.set(new_value);
    }

    /// Get the number of subscribed effects.
    pub fn subscriber_count(&self) -> usize {
        self.dependency.subscriber_count()
    }
}

impl<T> Clone for Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            dependency: Arc::clone(&self.dependency),
        }
    }
}

impl<T> Debug for Signal<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("value", &self.get_untracked())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
