//! Action Queue Manager
//!
//! Decides, per requested run, whether an automation runs immediately or is
//! serialized behind others on its owner's queue.
//!
//! # Drain loop
//!
//! A queue that receives an entry while idle is marked draining and a drain
//! task is spawned for it. The task repeatedly:
//!
//! 1. starts a [`SequenceRunner`] for the head entry and awaits it,
//! 2. logs a failure (if any) and removes the entry,
//! 3. waits the settle delay and goes back to 1, stopping there if the
//!    queue is empty.
//!
//! The settle delay follows every run, so an entry enqueued just as the
//! previous one finished still starts a full delay later. The queue stays
//! draining while it settles, then an idle queue is removed from the
//! manager.
//!
//! Every spawn goes through the calling thread's runtime handle. Called
//! with no runtime, the manager returns [`EngineError::NoRuntime`] and
//! leaves its queues untouched. Queue creation,
//! enqueue and removal all take the map shard lock before the queue's own
//! lock, so a late enqueue either lands in a queue the drain task still owns
//! or creates a fresh one.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tracing::{debug, error, info, instrument, warn};

use super::{Dispatch, QueueEntry, QueueKey, RunHandle};
use crate::automation::{Automation, AutomationResolver};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::registry::ActionRegistry;
use crate::sequence::{Sequence, SequenceDebugger, SequenceRunner};

#[derive(Default)]
struct Queue {
    entries: VecDeque<QueueEntry>,
    draining: bool,
    current: Option<Arc<SequenceRunner>>,
}

impl Queue {
    fn pending(&self) -> usize {
        self.entries.len() - usize::from(self.current.is_some())
    }
}

struct ManagerInner {
    config: EngineConfig,
    registry: Arc<dyn ActionRegistry>,
    resolvers: DashMap<String, Arc<dyn AutomationResolver>>,
    queues: DashMap<QueueKey, Arc<Mutex<Queue>>>,
    tests: DashMap<String, Arc<SequenceRunner>>,
    debugger: RwLock<Option<Arc<dyn SequenceDebugger>>>,
    next_entry: AtomicU64,
}

/// Owns the named queues and starts every run. Cheap to clone.
#[derive(Clone)]
pub struct ActionQueueManager {
    inner: Arc<ManagerInner>,
}

impl ActionQueueManager {
    pub fn new(config: EngineConfig, registry: Arc<dyn ActionRegistry>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                registry,
                resolvers: DashMap::new(),
                queues: DashMap::new(),
                tests: DashMap::new(),
                debugger: RwLock::new(None),
                next_entry: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Route automation lookups for `domain` to `resolver`.
    pub fn register_resolver(&self, domain: impl Into<String>, resolver: Arc<dyn AutomationResolver>) {
        self.inner.resolvers.insert(domain.into(), resolver);
    }

    pub fn unregister_resolver(&self, domain: &str) -> bool {
        self.inner.resolvers.remove(domain).is_some()
    }

    /// Attach a debug sink to every runner started from now on.
    pub fn set_debugger(&self, debugger: Arc<dyn SequenceDebugger>) {
        *self.inner.debugger.write() = Some(debugger);
    }

    fn resolve(
        &self,
        domain: &str,
        owner_id: &str,
        automation_id: &str,
    ) -> Result<Arc<Automation>, EngineError> {
        let resolver = self
            .inner
            .resolvers
            .get(domain)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::UnknownDomain(domain.to_owned()))?;

        resolver
            .resolve(owner_id, automation_id)
            .ok_or_else(|| EngineError::UnknownAutomation {
                domain: domain.to_owned(),
                owner_id: owner_id.to_owned(),
                automation_id: automation_id.to_owned(),
            })
    }

    fn runner(&self, sequence: Arc<Sequence>, context: Map<String, Value>) -> SequenceRunner {
        let runner = SequenceRunner::new(sequence, Arc::clone(&self.inner.registry), context);
        match self.inner.debugger.read().as_ref() {
            Some(debugger) => runner.with_debugger(Arc::clone(debugger)),
            None => runner,
        }
    }

    /// Run an automation now, or append it to its owner's queue if it is
    /// serialized. Never waits for the run itself.
    #[instrument(skip(self, context))]
    pub fn queue_or_run(
        &self,
        domain: &str,
        owner_id: &str,
        automation_id: &str,
        context: Map<String, Value>,
    ) -> Result<Dispatch, EngineError> {
        let automation = self.resolve(domain, owner_id, automation_id)?;
        let runtime = current_runtime()?;

        if !automation.serialized {
            let handle = self.spawn_run(&runtime, Arc::clone(&automation.sequence), context);
            return Ok(Dispatch::Started(handle));
        }

        let key = QueueKey::new(domain, owner_id);
        let entry = QueueEntry {
            id: self.inner.next_entry.fetch_add(1, Ordering::Relaxed),
            automation_id: automation_id.to_owned(),
            automation,
            context,
        };
        self.enqueue(&runtime, key, entry)
    }

    fn enqueue(
        &self,
        runtime: &Handle,
        key: QueueKey,
        entry: QueueEntry,
    ) -> Result<Dispatch, EngineError> {
        let (queue, position, start) = {
            let slot = self.inner.queues.entry(key.clone()).or_default();
            let queue = Arc::clone(slot.value());
            let mut locked = queue.lock();

            if let Some(max) = self.inner.config.max_queued {
                if locked.pending() >= max {
                    warn!(queue = %key, max, automation = %entry.automation_id, "queue full, dropping run");
                    return Err(EngineError::QueueFull { queue: key, max });
                }
            }

            locked.entries.push_back(entry);
            let position = locked.pending() - 1;
            let start = !locked.draining;
            locked.draining = true;
            drop(locked);
            (queue, position, start)
        };

        debug!(queue = %key, position, "run queued");
        if start {
            runtime.spawn(self.clone().drain(key.clone(), queue));
        }
        Ok(Dispatch::Queued {
            queue: key,
            position,
        })
    }

    async fn drain(self, key: QueueKey, queue: Arc<Mutex<Queue>>) {
        debug!(queue = %key, "drain started");
        loop {
            let (entry, runner) = {
                let mut locked = queue.lock();
                let Some(entry) = locked.entries.front().cloned() else {
                    locked.draining = false;
                    break;
                };
                let runner = Arc::new(self.runner(
                    Arc::clone(&entry.automation.sequence),
                    entry.context.clone(),
                ));
                locked.current = Some(Arc::clone(&runner));
                (entry, runner)
            };

            match AssertUnwindSafe(runner.run()).catch_unwind().await {
                Ok(Ok(completion)) => {
                    debug!(queue = %key, automation = %entry.automation_id, ?completion, "queued run finished");
                }
                Ok(Err(source)) => {
                    let err = EngineError::QueueDrain {
                        queue: key.clone(),
                        automation_id: entry.automation_id.clone(),
                        source: Box::new(source),
                    };
                    error!(error = %err, "queued run failed");
                }
                Err(_) => {
                    error!(queue = %key, automation = %entry.automation_id, "queued run panicked");
                }
            }

            {
                let mut locked = queue.lock();
                locked.current = None;
                if locked.entries.front().map(|head| head.id) == Some(entry.id) {
                    locked.entries.pop_front();
                }
            }

            tokio::time::sleep(self.inner.config.settle_delay()).await;
        }

        let removed = self.inner.queues.remove_if(&key, |_, queue| {
            let queue = queue.lock();
            queue.entries.is_empty() && !queue.draining
        });
        if removed.is_some() {
            debug!(queue = %key, "queue idle, removed");
        }
    }

    /// Spawn an unqueued run of `sequence`.
    pub fn run_sequence(
        &self,
        sequence: Arc<Sequence>,
        context: Map<String, Value>,
    ) -> Result<RunHandle, EngineError> {
        let runtime = current_runtime()?;
        Ok(self.spawn_run(&runtime, sequence, context))
    }

    fn spawn_run(
        &self,
        runtime: &Handle,
        sequence: Arc<Sequence>,
        context: Map<String, Value>,
    ) -> RunHandle {
        let runner = Arc::new(self.runner(sequence, context));
        let task = Arc::clone(&runner);
        let handle = runtime.spawn(async move { task.run().await });
        RunHandle::new(runner, handle)
    }

    /// Run an ad-hoc sequence outside any queue, addressable by `test_id`
    /// until it finishes. Starting a test under an id still in use aborts
    /// the previous one.
    #[instrument(skip(self, sequence, context))]
    pub fn run_test_sequence(
        &self,
        test_id: &str,
        sequence: Sequence,
        context: Map<String, Value>,
    ) -> Result<RunHandle, EngineError> {
        let runtime = current_runtime()?;
        let runner = Arc::new(self.runner(Arc::new(sequence), context));
        if let Some(previous) = self
            .inner
            .tests
            .insert(test_id.to_owned(), Arc::clone(&runner))
        {
            info!(test_id, "replacing running test sequence");
            previous.abort();
        }

        let manager = self.clone();
        let id = test_id.to_owned();
        let task = Arc::clone(&runner);
        let handle = runtime.spawn(async move {
            let result = task.run().await;
            manager
                .inner
                .tests
                .remove_if(&id, |_, current| Arc::ptr_eq(current, &task));
            result
        });
        Ok(RunHandle::new(runner, handle))
    }

    /// Abort the test run registered under `test_id`.
    pub fn stop_test_sequence(&self, test_id: &str) -> bool {
        match self.inner.tests.get(test_id) {
            Some(runner) => {
                runner.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_test_running(&self, test_id: &str) -> bool {
        self.inner.tests.contains_key(test_id)
    }

    /// Drop every pending entry of `key` and abort its running head.
    /// Returns how many pending entries were dropped.
    pub fn abort_queue(&self, key: &QueueKey) -> usize {
        let Some(queue) = self.inner.queues.get(key).map(|q| Arc::clone(q.value())) else {
            return 0;
        };

        let mut locked = queue.lock();
        let keep = usize::from(locked.current.is_some());
        let dropped = locked.entries.len().saturating_sub(keep);
        locked.entries.truncate(keep);
        if let Some(runner) = &locked.current {
            runner.abort();
        }
        info!(queue = %key, dropped, "queue aborted");
        dropped
    }

    /// Entries on `key`, including the one currently running.
    pub fn queue_len(&self, key: &QueueKey) -> usize {
        self.inner
            .queues
            .get(key)
            .map_or(0, |queue| queue.lock().entries.len())
    }

    pub fn is_draining(&self, key: &QueueKey) -> bool {
        self.inner
            .queues
            .get(key)
            .is_some_and(|queue| queue.lock().draining)
    }

    pub fn has_queue(&self, key: &QueueKey) -> bool {
        self.inner.queues.contains_key(key)
    }

    pub fn queue_count(&self) -> usize {
        self.inner.queues.len()
    }
}

fn current_runtime() -> Result<Handle, EngineError> {
    Handle::try_current().map_err(|_| {
        warn!("run requested outside a tokio runtime");
        EngineError::NoRuntime
    })
}

impl std::fmt::Debug for ActionQueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionQueueManager")
            .field("config", &self.inner.config)
            .field("queues", &self.inner.queues.len())
            .field("tests", &self.inner.tests.len())
            .finish()
    }
}
