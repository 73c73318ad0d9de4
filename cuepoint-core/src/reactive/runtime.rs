//! Reactive Runtime
//!
//! The runtime connects writes to re-runs. It owns no state of its own: the
//! graph lives in the dependencies and effects. What it decides is *when* a
//! notified dependency flushes.
//!
//! # How It Works
//!
//! 1. A write calls [`Dependency::notify`]. The first notification marks
//!    the dependency pending and hands it to [`Runtime::schedule_flush`].
//!
//! 2. The flush is spawned as its own task. On a current-thread runtime a
//!    spawned task cannot start before the writing task yields, so the flush
//!    fires at the end of the current synchronous turn and every write made
//!    in that turn is folded into it.
//!
//! 3. The flush re-runs the subscribed effects and clears the pending flag
//!    once all of them have finished.
//!
//! # Threading
//!
//! Everything here is `Send + Sync`, so effects and objects may be used
//! from a multi-thread runtime too. There a flush may start as soon as a
//! worker picks it up, which can split one burst of writes into more than
//! one flush. Use a current-thread runtime (or a `LocalSet`) where exact
//! turn-level coalescing matters.

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::warn;

use super::context::ReactiveContext;
use super::dependency::Dependency;
use super::subscriber::EffectId;

/// Entry points for scheduling and context queries.
pub struct Runtime;

impl Runtime {
    /// Schedule `dep` to flush after the current turn.
    ///
    /// Outside a tokio runtime there is nothing to run effects on; the
    /// notification is dropped with a warning.
    pub(crate) fn schedule_flush(dep: Arc<Dependency>) {
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    dep.flush().await;
                });
            }
            Err(_) => {
                warn!(dependency = ?dep.id(), "write outside a tokio runtime; effects not re-run");
                dep.clear_pending();
            }
        }
    }

    /// Get the effect currently being tracked, if any.
    pub fn current_effect() -> Option<EffectId> {
        ReactiveContext::current_id()
    }

    /// Check if we're inside a reactive context.
    pub fn is_tracking() -> bool {
        ReactiveContext::is_active()
    }
}
