//! Counter of outstanding operations with an idle wait.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Counts operations that have started but not completed.
#[derive(Debug, Default)]
pub struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    /// Create an idle counter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark one operation started.
    pub fn begin(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Mark one operation completed. Extra calls are ignored.
    pub fn end(&self) {
        let previous = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.idle.notify_waiters();
        }
    }

    /// Start an operation that ends when the guard is dropped.
    #[must_use]
    pub fn track(self: &Arc<Self>) -> InFlightGuard {
        self.begin();
        InFlightGuard(Arc::clone(self))
    }

    /// Number of outstanding operations.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until no operation is outstanding.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            if self.count() == 0 {
                return;
            }
            idle.await;
        }
    }
}

/// Ends its operation on drop.
#[derive(Debug)]
pub struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.end();
    }
}
