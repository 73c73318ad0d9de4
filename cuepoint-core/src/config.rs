//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs for the queue manager.
///
/// Every field has a default, so an empty object deserializes to
/// [`EngineConfig::default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Pause inserted between two consecutive entries drained from the same
    /// queue.
    pub settle_delay_ms: u64,

    /// Maximum number of pending entries per queue. `None` means unbounded.
    pub max_queued: Option<usize>,
}

impl EngineConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 30,
            max_queued: None,
        }
    }
}
