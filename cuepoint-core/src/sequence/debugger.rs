//! Debug sink for sequence runs.
//!
//! A runner reports progress to an optional [`SequenceDebugger`]. Every
//! method has a no-op default, so sinks implement only what they display.

use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use crate::error::EngineError;

/// Observer of one sequence run.
pub trait SequenceDebugger: Send + Sync {
    fn sequence_started(&self) {}
    fn sequence_ended(&self) {}
    fn mark_start(&self, _id: &str) {}
    fn mark_end(&self, _id: &str) {}
    fn log_result(&self, _id: &str, _result: &Value) {}
    fn log_error(&self, _id: &str, _err: &EngineError) {}
}

/// A sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDebugger;

impl SequenceDebugger for NoopDebugger {}

/// One observation recorded by [`RecordingDebugger`].
#[derive(Debug, Clone, PartialEq)]
pub enum DebugEvent {
    SequenceStarted,
    SequenceEnded,
    Start(String),
    End(String),
    Result(String, Value),
    Error(String, String),
}

/// A sink that keeps every event with the (tokio) time it happened.
///
/// Backs progress displays that need to know which leaves are active, and
/// is what the tests assert ordering against.
#[derive(Debug, Default)]
pub struct RecordingDebugger {
    events: Mutex<Vec<(Instant, DebugEvent)>>,
}

impl RecordingDebugger {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: DebugEvent) {
        self.events.lock().push((Instant::now(), event));
    }

    pub fn events(&self) -> Vec<DebugEvent> {
        self.events.lock().iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn timed_events(&self) -> Vec<(Instant, DebugEvent)> {
        self.events.lock().clone()
    }

    /// Start/end markers only, rendered as `"start(id)"` / `"end(id)"`.
    pub fn marks(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|(_, event)| match event {
                DebugEvent::Start(id) => Some(format!("start({id})")),
                DebugEvent::End(id) => Some(format!("end({id})")),
                _ => None,
            })
            .collect()
    }

    /// When the leaf `id` was marked started, if it was.
    pub fn started_at(&self, id: &str) -> Option<Instant> {
        self.events.lock().iter().find_map(|(at, event)| match event {
            DebugEvent::Start(started) if started == id => Some(*at),
            _ => None,
        })
    }

    /// When the leaf `id` was marked ended, if it was.
    pub fn ended_at(&self, id: &str) -> Option<Instant> {
        self.events.lock().iter().find_map(|(at, event)| match event {
            DebugEvent::End(ended) if ended == id => Some(*at),
            _ => None,
        })
    }

    /// Leaves started but not yet ended.
    pub fn active(&self) -> Vec<String> {
        let mut active = Vec::new();
        for (_, event) in self.events.lock().iter() {
            match event {
                DebugEvent::Start(id) => active.push(id.clone()),
                DebugEvent::End(id) => {
                    if let Some(pos) = active.iter().position(|a| a == id) {
                        active.remove(pos);
                    }
                }
                _ => {}
            }
        }
        active
    }
}

impl SequenceDebugger for RecordingDebugger {
    fn sequence_started(&self) {
        self.push(DebugEvent::SequenceStarted);
    }

    fn sequence_ended(&self) {
        self.push(DebugEvent::SequenceEnded);
    }

    fn mark_start(&self, id: &str) {
        self.push(DebugEvent::Start(id.to_owned()));
    }

    fn mark_end(&self, id: &str) {
        self.push(DebugEvent::End(id.to_owned()));
    }

    fn log_result(&self, id: &str, result: &Value) {
        self.push(DebugEvent::Result(id.to_owned(), result.clone()));
    }

    fn log_error(&self, id: &str, err: &EngineError) {
        self.push(DebugEvent::Error(id.to_owned(), err.to_string()));
    }
}
