//! A reusable open/close latch coordinating the key producer with consumers.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tokio::time::{timeout_at, Duration, Instant};

/// Latch that can be opened and re-closed any number of times.
///
/// Consumers open it when a queue runs low; the producer waits on it, fills
/// the queues, and closes it again once capacity is reached.
#[derive(Debug, Default)]
pub struct ReclosableLatch {
    open: AtomicBool,
    notify: Notify,
}

impl ReclosableLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Open the latch, waking all current waiters.
    pub fn open(&self) {
        if !self.open.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    /// Close the latch; subsequent waits block until the next `open`.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Wait until the latch is open or the timeout elapses.
    /// Returns whether the latch was open when the wait ended.
    pub async fn wait_timeout(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            // Register interest before the state check, so an open between
            // the check and the await cannot be missed.
            let notified = self.notify.notified();
            if self.is_open() {
                return true;
            }
            if timeout_at(deadline, notified).await.is_err() {
                return self.is_open();
            }
        }
    }
}
