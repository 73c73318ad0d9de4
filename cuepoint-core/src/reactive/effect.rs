//! Effect Implementation
//!
//! An Effect is an async computation that re-runs whenever state it read
//! during its previous run is written.
//!
//! # How Effects Work
//!
//! 1. A run installs the effect as the current effect (see
//!    [`ReactiveContext`]) for the whole of its future, suspension points
//!    included.
//!
//! 2. Every tracked read during the run subscribes the effect to that
//!    property's [`Dependency`] and is added to the run's fresh set.
//!
//! 3. When the run finishes, the effect unsubscribes from every dependency
//!    it read last time but not this time. The subscriber graph therefore
//!    always mirrors the latest run.
//!
//! 4. A write to any dependency in the set schedules a re-run.
//!
//! Runs of one effect never overlap. An effect subscribed to two
//! dependencies written in the same turn is re-run by two flushes; the
//! second waits for the first to finish, so each run sees its own fresh set.
//!
//! # Change callbacks
//!
//! [`Effect::run_on_change`] splits the effect in two: a watcher that is
//! tracked, and a callback invoked after each re-triggered watcher run. The
//! callback's own reads are not tracked.
//!
//! # Disposal
//!
//! Effects live until [`Effect::dispose`] is called. Dropping every handle
//! does not stop an effect that is still subscribed somewhere.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, error};

use super::context::ReactiveContext;
use super::dependency::Dependency;
use super::subscriber::{DependencyId, EffectId};
use crate::error::BoxError;

/// Future returned by an effect function.
pub type EffectFuture = BoxFuture<'static, Result<(), BoxError>>;

type EffectFn = dyn Fn() -> EffectFuture + Send + Sync;

type DependencySet = IndexMap<DependencyId, Weak<Dependency>>;

struct EffectInner {
    id: EffectId,
    func: Box<EffectFn>,
    on_change: Option<Box<EffectFn>>,
    /// Dependencies this effect is subscribed to.
    dependencies: Mutex<DependencySet>,
    /// Dependencies read by the run in progress.
    fresh: Mutex<Option<DependencySet>>,
    /// Held for the whole of a run.
    running: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
    run_count: AtomicUsize,
}

/// A re-runnable async computation whose tracked reads are recorded.
///
/// Cloning an `Effect` yields another handle to the same effect.
#[derive(Clone)]
pub struct Effect {
    inner: Arc<EffectInner>,
}

fn boxed<F, Fut>(f: F) -> Box<EffectFn>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Box::new(move || f().boxed())
}

impl Effect {
    fn from_parts(func: Box<EffectFn>, on_change: Option<Box<EffectFn>>) -> Self {
        Self {
            inner: Arc::new(EffectInner {
                id: EffectId::new(),
                func,
                on_change,
                dependencies: Mutex::new(IndexMap::new()),
                fresh: Mutex::new(None),
                running: tokio::sync::Mutex::new(()),
                disposed: AtomicBool::new(false),
                run_count: AtomicUsize::new(0),
            }),
        }
    }

    /// Create an effect and run it once to establish its dependencies.
    ///
    /// A failing first run is logged; the effect stays subscribed to
    /// whatever it read before failing.
    pub async fn new<F, Fut>(func: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let effect = Self::new_lazy(func);
        effect.rerun_logged().await;
        effect
    }

    /// Create an effect without running it.
    pub fn new_lazy<F, Fut>(func: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self::from_parts(boxed(func), None)
    }

    /// Create an effect that tracks `watch` and calls `on_change` after
    /// every re-triggered run of `watch`.
    ///
    /// The initial run of `watch` does not call `on_change`.
    pub async fn run_on_change<W, WFut, C, CFut>(watch: W, on_change: C) -> Self
    where
        W: Fn() -> WFut + Send + Sync + 'static,
        WFut: Future<Output = Result<(), BoxError>> + Send + 'static,
        C: Fn() -> CFut + Send + Sync + 'static,
        CFut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let effect = Self::from_parts(boxed(watch), Some(boxed(on_change)));
        if let Err(err) = effect.run().await {
            error!(effect = %effect.id(), error = %err, "initial watcher run failed");
        }
        effect
    }

    pub fn id(&self) -> EffectId {
        self.inner.id
    }

    /// Execute the effect function with this effect as the current one.
    ///
    /// Subscriptions not renewed by this run are dropped afterwards.
    pub async fn run(&self) -> Result<(), BoxError> {
        if self.is_disposed() {
            return Ok(());
        }

        let _running = self.inner.running.lock().await;
        if self.is_disposed() {
            return Ok(());
        }

        *self.inner.fresh.lock() = Some(IndexMap::new());

        // The function itself is called inside the scope so reads made
        // before its first `.await` are tracked too.
        let result = ReactiveContext::scope(self.clone(), async { (self.inner.func)().await }).await;

        let fresh = self.inner.fresh.lock().take().unwrap_or_default();
        if !self.is_disposed() {
            self.retain_only(fresh);
        }
        self.inner.run_count.fetch_add(1, Ordering::Relaxed);

        result
    }

    /// Re-run in response to a notification: the watcher, then the change
    /// callback if there is one.
    async fn rerun(&self) -> Result<(), BoxError> {
        self.run().await?;
        if self.is_disposed() {
            return Ok(());
        }
        match &self.inner.on_change {
            Some(on_change) => on_change().await,
            None => Ok(()),
        }
    }

    /// Re-run, logging instead of returning any error or panic.
    pub(crate) async fn rerun_logged(&self) {
        match AssertUnwindSafe(self.rerun()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(effect = %self.id(), error = %err, "reactive effect failed"),
            Err(_) => error!(effect = %self.id(), "reactive effect panicked"),
        }
    }

    /// Called by a dependency that just subscribed this effect.
    pub(crate) fn added(&self, dep: &Arc<Dependency>) {
        let weak = Arc::downgrade(dep);
        self.inner
            .dependencies
            .lock()
            .entry(dep.id())
            .or_insert_with(|| weak.clone());
        if let Some(fresh) = self.inner.fresh.lock().as_mut() {
            fresh.entry(dep.id()).or_insert(weak);
        }
    }

    fn retain_only(&self, fresh: DependencySet) {
        let stale: Vec<Weak<Dependency>> = {
            let mut deps = self.inner.dependencies.lock();
            let stale = deps
                .iter()
                .filter(|(id, _)| !fresh.contains_key(*id))
                .map(|(_, dep)| dep.clone())
                .collect();
            *deps = fresh;
            stale
        };

        for dep in stale.iter().filter_map(Weak::upgrade) {
            dep.remove_effect(self.id());
        }
        if !stale.is_empty() {
            debug!(effect = %self.id(), dropped = stale.len(), "unsubscribed from stale dependencies");
        }
    }

    /// Dispose of the effect.
    ///
    /// Unsubscribes from every dependency. After disposal the effect will
    /// not run again.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let deps = std::mem::take(&mut *self.inner.dependencies.lock());
        for dep in deps.values().filter_map(Weak::upgrade) {
            dep.remove_effect(self.id());
        }
    }

    /// Check if the effect has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Get the number of times the effect has run.
    pub fn run_count(&self) -> usize {
        self.inner.run_count.load(Ordering::Relaxed)
    }

    /// Get the number of live dependencies.
    pub fn dependency_count(&self) -> usize {
        self.inner
            .dependencies
            .lock()
            .values()
            .filter(|dep| dep.strong_count() > 0)
            .count()
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.id())
            .field("run_count", &self.run_count())
            .field("dependency_count", &self.dependency_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[tokio::test]
    async fn effect_runs_on_creation() {
        let run_count = Arc::new(AtomicI32::new(0));
        let run_count_clone = run_count.clone();

        let _effect = Effect::new(move || {
            let run_count = run_count_clone.clone();
            async move {
                run_count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert_eq!(run_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn effect_lazy_does_not_run_on_creation() {
        let effect = Effect::new_lazy(|| async { Ok(()) });
        assert_eq!(effect.run_count(), 0);

        effect.run().await.unwrap();
        assert_eq!(effect.run_count(), 1);
    }

    #[tokio::test]
    async fn effect_does_not_run_after_disposal() {
        let effect = Effect::new(|| async { Ok(()) }).await;
        assert_eq!(effect.run_count(), 1);

        effect.dispose();
        assert!(effect.is_disposed());

        effect.run().await.unwrap();
        effect.rerun_logged().await;
        assert_eq!(effect.run_count(), 1);
    }

    #[tokio::test]
    async fn run_returns_function_error() {
        let effect = Effect::new_lazy(|| async { Err::<(), BoxError>("template failed".into()) });
        let err = effect.run().await.unwrap_err();
        assert_eq!(err.to_string(), "template failed");
        assert_eq!(effect.run_count(), 1);
    }

    #[tokio::test]
    async fn rerun_logged_swallows_panics() {
        let effect = Effect::new_lazy(|| async {
            if true {
                panic!("effect blew up");
            }
            Ok::<(), BoxError>(())
        });
        effect.rerun_logged().await;
        assert!(!effect.is_disposed());
    }

    #[tokio::test]
    async fn dispose_unsubscribes_from_every_dependency() {
        let a = Dependency::new();
        let b = Dependency::new();

        let (a2, b2) = (a.clone(), b.clone());
        let effect = Effect::new(move || {
            let (a, b) = (a2.clone(), b2.clone());
            async move {
                a.track();
                b.track();
                Ok(())
            }
        })
        .await;

        assert_eq!(effect.dependency_count(), 2);
        assert!(a.contains(effect.id()));
        assert!(b.contains(effect.id()));

        effect.dispose();
        assert!(!a.contains(effect.id()));
        assert!(!b.contains(effect.id()));
        assert_eq!(effect.dependency_count(), 0);
    }

    #[tokio::test]
    async fn rerun_drops_stale_dependencies() {
        let toggle = Arc::new(AtomicBool::new(true));
        let a = Dependency::new();
        let b = Dependency::new();

        let (t2, a2, b2) = (toggle.clone(), a.clone(), b.clone());
        let effect = Effect::new(move || {
            let (toggle, a, b) = (t2.clone(), a2.clone(), b2.clone());
            async move {
                if toggle.load(Ordering::SeqCst) {
                    a.track();
                } else {
                    b.track();
                }
                Ok(())
            }
        })
        .await;

        assert!(a.contains(effect.id()));
        assert!(!b.contains(effect.id()));

        toggle.store(false, Ordering::SeqCst);
        effect.run().await.unwrap();

        assert!(!a.contains(effect.id()));
        assert!(b.contains(effect.id()));
        assert_eq!(effect.dependency_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_reruns_keep_every_subscription() {
        use crate::reactive::Signal;
        use std::time::Duration;

        let a = Signal::new(0);
        let b = Signal::new(0);

        let (a2, b2) = (a.clone(), b.clone());
        let effect = Effect::new(move || {
            let (a, b) = (a2.clone(), b2.clone());
            async move {
                let _ = a.get();
                tokio::time::sleep(Duration::from_millis(10)).await;
                let _ = b.get();
                Ok(())
            }
        })
        .await;
        assert_eq!(effect.dependency_count(), 2);

        // Both dependencies flush in the same turn and re-run the effect twice.
        a.set(1);
        b.set(1);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(effect.run_count(), 3);
        assert_eq!(effect.dependency_count(), 2);
        assert_eq!(a.subscriber_count(), 1);
        assert_eq!(b.subscriber_count(), 1);

        a.set(2);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(effect.run_count(), 4);
    }

    #[test]
    fn effect_clone_shares_state() {
        let effect1 = Effect::new_lazy(|| async { Ok(()) });
        let effect2 = effect1.clone();

        assert_eq!(effect1.id(), effect2.id());

        effect1.dispose();
        assert!(effect2.is_disposed());
    }
}
