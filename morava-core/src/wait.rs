use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation predicate handed into blocking receive calls.
///
/// A condition is polled by the waiter; it never registers for push
/// notification. The consumer endpoint's receive loop is expected to park
/// briefly between polls, so a condition becoming satisfied is observed
/// within one park interval.
#[derive(Debug, Clone)]
pub enum WaitCondition {
    /// Always satisfied; makes receive non-blocking.
    Immediate,
    /// Satisfied once the current time passes the deadline.
    Deadline(Instant),
    /// Satisfied when the token is cancelled; the stop/cancel signal.
    Flag(CancellationToken),
    /// Satisfied when any member condition is satisfied.
    Any(Vec<WaitCondition>),
}

impl WaitCondition {
    pub fn is_satisfied(&self) -> bool {
        match self {
            WaitCondition::Immediate => true,
            WaitCondition::Deadline(deadline) => Instant::now() >= *deadline,
            WaitCondition::Flag(token) => token.is_cancelled(),
            WaitCondition::Any(conditions) => conditions.iter().any(|c| c.is_satisfied()),
        }
    }

    pub fn deadline_in(wait: Duration) -> Self {
        WaitCondition::Deadline(Instant::now() + wait)
    }

    /// Stop-aware condition for a caller-supplied wait.
    ///
    /// A zero wait means wait indefinitely, so the deadline arm is omitted
    /// rather than produced as an already-expired deadline.
    pub fn for_wait(wait: Duration, stop: CancellationToken) -> Self {
        if wait.is_zero() {
            WaitCondition::Flag(stop)
        } else {
            WaitCondition::Any(vec![
                WaitCondition::Flag(stop),
                WaitCondition::deadline_in(wait),
            ])
        }
    }
}
