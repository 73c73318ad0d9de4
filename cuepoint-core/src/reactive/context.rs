//! Reactive Context
//!
//! The reactive context tracks which effect is currently running, so that
//! reads of tracked properties can be attributed to it.
//!
//! # Implementation
//!
//! Effects are async: an effect function may await template resolution or
//! other nested work and keep reading state afterwards. A thread-local
//! stack cannot follow a future across an `.await` (the task may resume on
//! another worker, and other tasks interleave on the same thread), so the
//! current effect lives in a tokio task-local instead. The task-local is
//! installed around the effect's future by [`ReactiveContext::scope`] and is
//! visible at every poll of that future, including after suspension.
//!
//! Scopes nest: an effect run from inside another effect shadows the outer
//! one for the duration of the inner future.
//!
//! Work moved onto another task with `tokio::spawn` does not inherit the
//! scope. Reads made there are untracked.

use std::future::Future;

use super::effect::Effect;
use super::subscriber::EffectId;

tokio::task_local! {
    static ACTIVE_EFFECT: Effect;
}

/// Accessors for the task-local "current effect".
pub struct ReactiveContext;

impl ReactiveContext {
    /// Run `fut` with `effect` installed as the current effect for every
    /// poll of `fut`.
    pub async fn scope<F>(effect: Effect, fut: F) -> F::Output
    where
        F: Future,
    {
        ACTIVE_EFFECT.scope(effect, fut).await
    }

    /// The effect currently collecting dependencies, if any.
    pub fn current() -> Option<Effect> {
        ACTIVE_EFFECT.try_with(Effect::clone).ok()
    }

    /// Get the current effect's ID, if any.
    pub fn current_id() -> Option<EffectId> {
        ACTIVE_EFFECT.try_with(Effect::id).ok()
    }

    /// Check if there is an active reactive context.
    pub fn is_active() -> bool {
        ACTIVE_EFFECT.try_with(|_| ()).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn noop_effect() -> Effect {
        Effect::new_lazy(|| async { Ok(()) })
    }

    #[tokio::test]
    async fn context_tracks_effect() {
        let effect = noop_effect();
        let id = effect.id();

        assert!(!ReactiveContext::is_active());
        assert!(ReactiveContext::current_id().is_none());

        ReactiveContext::scope(effect, async move {
            assert!(ReactiveContext::is_active());
            assert_eq!(ReactiveContext::current_id(), Some(id));
        })
        .await;

        assert!(!ReactiveContext::is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn context_survives_suspension() {
        let effect = noop_effect();
        let id = effect.id();

        ReactiveContext::scope(effect, async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tokio::task::yield_now().await;
            assert_eq!(ReactiveContext::current_id(), Some(id));
        })
        .await;
    }

    #[tokio::test]
    async fn nested_contexts() {
        let outer = noop_effect();
        let inner = noop_effect();
        let (outer_id, inner_id) = (outer.id(), inner.id());

        ReactiveContext::scope(outer, async move {
            assert_eq!(ReactiveContext::current_id(), Some(outer_id));

            ReactiveContext::scope(inner, async move {
                assert_eq!(ReactiveContext::current_id(), Some(inner_id));
            })
            .await;

            assert_eq!(ReactiveContext::current_id(), Some(outer_id));
        })
        .await;

        assert!(ReactiveContext::current_id().is_none());
    }

    #[tokio::test]
    async fn spawned_work_is_untracked() {
        let effect = noop_effect();

        ReactiveContext::scope(effect, async move {
            let inside = tokio::spawn(async { ReactiveContext::is_active() })
                .await
                .unwrap();
            assert!(!inside);
        })
        .await;
    }
}
