//! Tracking of background work that outlives a request.
//!
//! Handlers that hand work off to a spawned task (sending mail, flushing a
//! buffer, ...) register it here so that shutdown can wait for it. The
//! outstanding count lives in a `watch` channel: every decrement notifies the
//! drain waiter, so a waiter that subscribed before the last `complete()` is
//! always woken.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Counter of in-flight background tasks.
///
/// Cheap to clone; all clones share the same count.
#[derive(Debug, Clone)]
pub struct BackgroundTaskTracker {
    outstanding: Arc<watch::Sender<usize>>,
}

impl BackgroundTaskTracker {
    /// Create a tracker with nothing outstanding.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            outstanding: Arc::new(tx),
        }
    }

    /// Record a unit of work about to be dispatched.
    ///
    /// Must be paired with exactly one later call to [`complete`](Self::complete).
    pub fn register(&self) {
        self.outstanding.send_modify(|n| *n += 1);
    }

    /// Record that a previously registered unit of work has finished.
    ///
    /// # Panics
    ///
    /// Panics if there is no outstanding registration to complete. That is a
    /// bug in the caller, not a runtime condition.
    pub fn complete(&self) {
        let mut underflow = false;
        self.outstanding.send_if_modified(|n| match n.checked_sub(1) {
            Some(next) => {
                *n = next;
                true
            }
            None => {
                underflow = true;
                false
            }
        });

        if underflow {
            panic!("BackgroundTaskTracker::complete called without a matching register");
        }
    }

    /// Number of tasks registered but not yet completed.
    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Wait until no tasks are outstanding.
    ///
    /// Resolves immediately if nothing is outstanding. There is no timeout:
    /// a registered task that never completes keeps this pending forever.
    pub async fn wait_drained(&self) {
        let mut rx = self.outstanding.subscribe();
        // The sender is owned by `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Register a unit of work and return a guard that completes it on drop.
    pub fn guard(&self) -> TaskGuard {
        self.register();
        TaskGuard {
            tracker: self.clone(),
        }
    }

    /// Spawn `task` on the runtime as a tracked background task.
    ///
    /// The task is registered before it is spawned and completed when it
    /// finishes, panics, or is aborted. A panic is logged rather than
    /// propagated.
    pub fn spawn<F>(&self, name: &'static str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.guard();

        tokio::spawn(async move {
            let _guard = guard;

            if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                tracing::error!(task = name, "background task panicked");
            }
        })
    }
}

impl Default for BackgroundTaskTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered unit of work. Completes its registration when dropped.
#[derive(Debug)]
#[must_use = "dropping the guard completes the task immediately"]
pub struct TaskGuard {
    tracker: BackgroundTaskTracker,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.tracker.complete();
    }
}
