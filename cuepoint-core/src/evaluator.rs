//! Activation Evaluator
//!
//! A state-driven trigger: an effect that evaluates an owner's activation
//! predicate against tracked state and, whenever the result flips, asks the
//! queue manager to run the owner's `activation` or `deactivation`
//! automation.
//!
//! The predicate is an ordinary effect body, so it may await (template
//! resolution, lookups) and every tracked read it makes, before or after
//! an `.await`, re-triggers it.

use std::future::Future;

use serde_json::Map;
use tracing::{debug, info, warn};

use crate::error::{BoxError, EngineError};
use crate::queue::{ActionQueueManager, QueueKey};
use crate::reactive::{Effect, Signal};

/// Automation dispatched on a false to true edge.
pub const ACTIVATION: &str = "activation";
/// Automation dispatched on a true to false edge.
pub const DEACTIVATION: &str = "deactivation";

#[derive(Debug)]
pub struct ActivationEvaluator {
    key: QueueKey,
    active: Signal<bool>,
    effect: Effect,
}

impl ActivationEvaluator {
    /// Start evaluating `predicate` for the owner identified by `key`.
    ///
    /// The owner starts inactive; the first evaluation runs before this
    /// returns and dispatches `activation` if the predicate already holds.
    pub async fn watch<P, Fut>(manager: ActionQueueManager, key: QueueKey, predicate: P) -> Self
    where
        P: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, BoxError>> + Send + 'static,
    {
        let active = Signal::new(false);

        let effect = Effect::new({
            let active = active.clone();
            let key = key.clone();
            move || {
                let evaluation = predicate();
                let active = active.clone();
                let key = key.clone();
                let manager = manager.clone();
                async move {
                    let now = evaluation.await?;
                    if now == active.get_untracked() {
                        return Ok(());
                    }
                    active.set(now);
                    dispatch(&manager, &key, now)
                }
            }
        })
        .await;

        Self { key, active, effect }
    }

    pub fn key(&self) -> &QueueKey {
        &self.key
    }

    pub fn is_active(&self) -> bool {
        self.active.get_untracked()
    }

    /// The "active" flag as a signal other effects can depend on.
    pub fn active_signal(&self) -> Signal<bool> {
        self.active.clone()
    }

    /// Re-evaluate now instead of waiting for a tracked write.
    pub async fn recompute(&self) -> Result<bool, BoxError> {
        self.effect.run().await?;
        Ok(self.is_active())
    }

    /// Stop evaluating. The current "active" value is left as is.
    pub fn dispose(&self) {
        debug!(owner = %self.key, "activation evaluator disposed");
        self.effect.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.effect.is_disposed()
    }
}

fn dispatch(manager: &ActionQueueManager, key: &QueueKey, active: bool) -> Result<(), BoxError> {
    let automation = if active { ACTIVATION } else { DEACTIVATION };
    info!(owner = %key, active, "activation changed");

    match manager.queue_or_run(&key.domain, &key.owner_id, automation, Map::new()) {
        Ok(_) => Ok(()),
        // Owners without an activation/deactivation automation are normal.
        Err(EngineError::UnknownAutomation { .. }) => Ok(()),
        Err(EngineError::QueueFull { .. }) => {
            warn!(owner = %key, automation, "activation dispatch dropped");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::{Automation, AutomationTable};
    use crate::config::EngineConfig;
    use crate::reactive::ReactiveObject;
    use crate::registry::ActionTable;
    use crate::sequence::{InstantAction, Sequence};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        manager: ActionQueueManager,
        activations: Arc<AtomicUsize>,
        deactivations: Arc<AtomicUsize>,
    }

    fn fixture() -> Fixture {
        let activations = Arc::new(AtomicUsize::new(0));
        let deactivations = Arc::new(AtomicUsize::new(0));

        let actions = ActionTable::new();
        for (name, counter) in [("on", &activations), ("off", &deactivations)] {
            let counter = Arc::clone(counter);
            actions.register_fn("test", name, move |_c, _ctx, _t| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            });
        }

        let automations = AutomationTable::new();
        automations.insert(
            "p1",
            Automation::new(ACTIVATION, Sequence::new(vec![InstantAction::new("a", "test", "on").into()])),
        );
        automations.insert(
            "p1",
            Automation::new(
                DEACTIVATION,
                Sequence::new(vec![InstantAction::new("d", "test", "off").into()]),
            ),
        );

        let manager = ActionQueueManager::new(EngineConfig::default(), Arc::new(actions));
        manager.register_resolver("profile", Arc::new(automations));
        Fixture {
            manager,
            activations,
            deactivations,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn dispatches_on_edges_only() {
        let fx = fixture();
        let state = ReactiveObject::new();
        state.set("viewers", json!(0));

        let evaluator = ActivationEvaluator::watch(fx.manager.clone(), QueueKey::new("profile", "p1"), {
            let state = state.clone();
            move || {
                let state = state.clone();
                async move {
                    let viewers = state.get("viewers").and_then(|v| v.as_u64()).unwrap_or(0);
                    Ok(viewers >= 10)
                }
            }
        })
        .await;
        assert!(!evaluator.is_active());

        state.set("viewers", json!(12));
        settle().await;
        assert!(evaluator.is_active());
        assert_eq!(fx.activations.load(Ordering::SeqCst), 1);

        // Still active, no second dispatch.
        state.set("viewers", json!(15));
        settle().await;
        assert_eq!(fx.activations.load(Ordering::SeqCst), 1);

        state.set("viewers", json!(3));
        settle().await;
        assert!(!evaluator.is_active());
        assert_eq!(fx.deactivations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disposed_evaluator_stops_reacting() {
        let fx = fixture();
        let state = ReactiveObject::new();

        let evaluator = ActivationEvaluator::watch(fx.manager.clone(), QueueKey::new("profile", "p1"), {
            let state = state.clone();
            move || {
                let state = state.clone();
                async move { Ok(state.get("live") == Some(json!(true))) }
            }
        })
        .await;
        assert_eq!(state.subscriber_count("live"), 1);

        evaluator.dispose();
        assert!(evaluator.is_disposed());
        assert_eq!(state.subscriber_count("live"), 0);

        state.set("live", json!(true));
        settle().await;
        assert!(!evaluator.is_active());
        assert_eq!(fx.activations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn recompute_picks_up_untracked_changes() {
        let fx = fixture();
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let evaluator = ActivationEvaluator::watch(fx.manager.clone(), QueueKey::new("profile", "p1"), {
            let flag = Arc::clone(&flag);
            move || {
                let flag = Arc::clone(&flag);
                async move { Ok(flag.load(Ordering::SeqCst)) }
            }
        })
        .await;

        flag.store(true, Ordering::SeqCst);
        assert!(evaluator.recompute().await.unwrap());
        settle().await;
        assert_eq!(fx.activations.load(Ordering::SeqCst), 1);
    }
}
