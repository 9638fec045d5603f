//! Supervised background tasks.
//!
//! Producer-triggered side effects (notification fan-out, reconciliation,
//! bus listeners) run detached from the request that caused them. A panic
//! inside one of them is caught and logged instead of unwinding into the
//! runtime, and every task is tracked so shutdown can wait for in-flight
//! work.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

/// Spawns and tracks detached tasks.
///
/// Cheap to clone; clones share the same tracker.
#[derive(Clone, Default)]
pub struct TaskSupervisor {
    tracker: TaskTracker,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `future` as a tracked task whose panics are logged.
    pub fn spawn<F>(&self, name: &'static str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(async move {
            if let Err(panic) = AssertUnwindSafe(future).catch_unwind().await {
                tracing::error!(
                    task = name,
                    panic = %panic_message(panic.as_ref()),
                    "Background task panicked"
                );
            }
        })
    }

    /// Number of tasks that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Close the tracker and wait until every tracked task has ended, or
    /// `timeout` elapses.
    ///
    /// Returns `true` if every task finished in time. Tasks spawned after
    /// this call are still tracked.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let finished = tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok();
        if !finished {
            tracing::warn!(
                in_flight = self.tracker.len(),
                "Timed out waiting for background tasks"
            );
        }
        finished
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
