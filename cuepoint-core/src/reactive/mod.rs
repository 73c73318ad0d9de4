//! Reactive Primitives
//!
//! Async-aware dependency tracking: objects, signals and effects.
//!
//! # Concepts
//!
//! ## Dependencies
//!
//! A [`Dependency`] records which effects read one `(object, property)`
//! pair. It is owned by the object and dies with it.
//!
//! ## Effects
//!
//! An [`Effect`] is an async computation. Everything it reads through a
//! tracked accessor during a run is attributed to it, including reads made
//! after the computation awaited something. A write to any of those
//! properties re-runs it.
//!
//! ## Objects and signals
//!
//! [`ReactiveObject`] holds named JSON properties, each tracked on its own.
//! [`Signal`] is the single-value form.
//!
//! # Implementation Notes
//!
//! The "current effect" is a tokio task-local rather than a thread-local,
//! which is what lets tracking follow a future across `.await`. Writes are
//! coalesced per dependency and flushed in a spawned task, so a burst of
//! writes in one turn causes one re-run per subscribed effect.

mod context;
mod dependency;
mod effect;
mod object;
mod runtime;
mod signal;
mod subscriber;

pub use context::ReactiveContext;
pub use dependency::{should_track, Dependency, DependencyMap, INTERNAL_KEY_PREFIX};
pub use effect::{Effect, EffectFuture};
pub use object::ReactiveObject;
pub use runtime::Runtime;
pub use signal::Signal;
pub use subscriber::{DependencyId, EffectId, ObjectId};
