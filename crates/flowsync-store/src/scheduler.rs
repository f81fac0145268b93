//! Cancellable delayed tasks.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A task that runs once its delay elapses unless cancelled first.
///
/// Cancelling only prevents a task that has not fired yet. Once the delay
/// elapsed the task runs to completion.
#[derive(Debug)]
pub struct ScheduledTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Prevent the task from firing. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the task ran to completion or was cancelled and exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Spawns [`ScheduledTask`]s that all stop on [`shutdown`](Self::shutdown).
#[derive(Debug, Default)]
pub struct Scheduler {
    root: CancellationToken,
}

impl Scheduler {
    /// New scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay`. Must be called inside a Tokio runtime.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> ScheduledTask
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.root.child_token();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => task.await,
            }
        });
        ScheduledTask { cancel, handle }
    }

    /// Cancel every task that has not fired yet, including future ones.
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }
}

/// Keeps at most one pending task: scheduling replaces the previous one.
#[derive(Debug, Default)]
pub struct Debouncer {
    scheduler: Scheduler,
    pending: Mutex<Option<ScheduledTask>>,
}

impl Debouncer {
    /// New debouncer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the pending task, if any, and schedule `task` after `delay`.
    pub fn schedule<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let next = self.scheduler.schedule(delay, task);
        if let Some(previous) = self.pending.lock().replace(next) {
            previous.cancel();
        }
    }

    /// Cancel the pending task. Returns whether one was waiting to fire.
    pub fn cancel(&self) -> bool {
        self.pending
            .lock()
            .take()
            .is_some_and(|task| {
                let waiting = !task.is_finished();
                task.cancel();
                waiting
            })
    }

    /// Whether a scheduled task has not finished yet.
    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished() && !task.is_cancelled())
    }

    /// Cancel the pending task and refuse new ones.
    pub fn shutdown(&self) {
        let _ = self.cancel();
        self.scheduler.shutdown();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
