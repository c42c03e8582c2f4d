use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use tokio::sync::Notify;
use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFuture};

/// Lifecycle supervisor for an adaptor's background I/O tasks.
///
/// An adaptor claims its single receive loop through [`begin`], every
/// connect/send/recv task it spawns holds a [`TaskGuard`], `stop()` asks
/// them all to wind down and `all_stopped()` resolves once stop was
/// requested and the last guard is gone.
///
/// [`begin`]: TaskSupervisor::begin
#[derive(Debug, Default)]
struct SupervisorState {
    started: AtomicBool,
    running: AtomicU64,
    stop: CancellationToken,
    idle: Notify,
}

#[derive(Debug, Default)]
pub struct TaskSupervisor(Arc<SupervisorState>);

#[derive(Debug)]
pub struct TaskGuard(Arc<SupervisorState>);

impl TaskSupervisor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the right to start the receive loop. Returns false when an
    /// earlier call already claimed it.
    pub fn begin(&self) -> bool {
        !self.0.started.swap(true, Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.0.stop.cancel();
    }

    #[must_use]
    pub fn drop_guard(&self) -> DropGuard {
        self.0.stop.clone().drop_guard()
    }

    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }

    /// Resolves once `stop()` was requested and every task guard has been
    /// dropped.
    pub async fn all_stopped(&self) {
        self.0.stop.cancelled().await;
        loop {
            // subscribe before the count check so a guard dropped in
            // between still wakes us
            let idle = self.0.idle.notified();
            if self.0.running.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }

    #[must_use]
    pub fn start_task(&self) -> TaskGuard {
        self.0.running.fetch_add(1, Ordering::AcqRel);
        TaskGuard(self.0.clone())
    }
}

impl Drop for TaskSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TaskGuard {
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.0.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}
