//! Cancellable per-member scheduled tasks.
//!
//! Retry timers and other deferred work belong to the member that scheduled
//! them. When the member's last registration goes away (or the peer is
//! dropped) everything still pending is cancelled.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Decrements the pending counter on drop, whether the task finished, was
/// cancelled or panicked.
struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }
}

/// Handle to one scheduled task.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    token: CancellationToken,
}

impl ScheduledTask {
    /// Cancel this task if it has not run yet (or stop it mid-flight).
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Tasks owned by one member.
#[derive(Debug, Default)]
pub struct MemberTasks {
    root: Mutex<CancellationToken>,
    pending: Arc<AtomicUsize>,
}

impl MemberTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay`, unless cancelled first.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule_after<F>(&self, delay: Duration, task: F) -> ScheduledTask
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.root.lock().child_token();
        self.pending.fetch_add(1, Ordering::Relaxed);
        let guard = PendingGuard(Arc::clone(&self.pending));
        let cancel = token.clone();
        tokio::spawn(async move {
            let _pending = guard;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = async {
                    tokio::time::sleep(delay).await;
                    task.await;
                } => {}
            }
        });
        ScheduledTask { token }
    }

    /// Run `task` now, under the same cancellation scope.
    pub fn spawn<F>(&self, task: F) -> ScheduledTask
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.schedule_after(Duration::ZERO, task)
    }

    /// Cancel everything scheduled so far. Later schedules are unaffected.
    pub fn cancel_all(&self) {
        let old = std::mem::take(&mut *self.root.lock());
        old.cancel();
    }

    /// Number of tasks that have not yet finished or been reaped.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }
}
