use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::errors::Result;

/// Coalescing single-flight trigger for a session's dispatch pass.
///
/// At most one pass runs at any time: the pass executes on a dedicated task
/// driven by a [`Notify`], which stores at most one pending permit. A
/// `schedule` while a pass is running therefore collapses any number of
/// concurrent requests into exactly one follow-up pass, and a `schedule`
/// while idle starts a pass promptly. There is no backlog of N runs for N
/// calls.
#[derive(Debug)]
pub struct DispatchCoordinator {
    trigger: Arc<Notify>,
    stopped: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl DispatchCoordinator {
    /// Spawns the pass loop. `pass` produces one dispatch-pass future per
    /// trigger; an error inside it is logged and the loop goes back to idle.
    /// Forward progress after a failure comes from the next `schedule` call,
    /// not from an automatic retry.
    pub fn spawn<F, Fut>(pass: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        let trigger = Arc::new(Notify::new());
        let stopped = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        let task_trigger = trigger.clone();
        let task_stopped = stopped.clone();
        let task_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_shutdown.cancelled() => break,
                    _ = task_trigger.notified() => {}
                }
                if task_stopped.load(Ordering::Acquire) {
                    continue;
                }
                if let Err(e) = (pass)().await {
                    warn!("Dispatch pass failed: {}", e);
                }
            }
        });

        Self {
            trigger,
            stopped,
            shutdown,
        }
    }

    /// Requests a pass. Concurrent calls while a pass runs coalesce into at
    /// most one extra pass after the current one finishes.
    pub fn schedule(&self) {
        self.trigger.notify_one();
    }

    /// Prevents further passes from starting. Only flips the gate; never
    /// waits for an in-flight pass to notice it.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.stopped.store(false, Ordering::Release);
    }
}

impl Drop for DispatchCoordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
#[path = "coordinator_test.rs"]
mod coordinator_test;
