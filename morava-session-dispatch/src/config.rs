use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the per-session dispatch loop.
///
/// The pass budgets bound how long one session can occupy a worker before
/// other sessions sharing the pool get a turn; leftover work re-triggers
/// another pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDispatchConfig {
    /// Maximum number of messages pushed in one dispatch pass.
    pub pass_message_budget: usize,
    /// Wall-clock cap for one dispatch pass, in milliseconds.
    pub pass_time_budget_ms: u64,
    /// Upper bound for one remote listener hand-off, in milliseconds.
    /// Past the bound the hand-off counts as not delivered.
    pub handoff_timeout_ms: u64,
}

impl Default for SessionDispatchConfig {
    fn default() -> Self {
        Self {
            pass_message_budget: 64,
            pass_time_budget_ms: 50,
            handoff_timeout_ms: 5000,
        }
    }
}

impl SessionDispatchConfig {
    pub(crate) fn pass_time_budget(&self) -> Duration {
        Duration::from_millis(self.pass_time_budget_ms)
    }

    pub(crate) fn handoff_timeout(&self) -> Duration {
        Duration::from_millis(self.handoff_timeout_ms)
    }
}
