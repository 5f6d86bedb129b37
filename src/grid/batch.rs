//! Transactional batch scoping.
//!
//! A batch is a scoped unit of work spanning one or more cache operations.
//! It is created by the request-handling path, may be suspended and resumed
//! across legacy callback boundaries, and is closed (committed) when the
//! request completes. Resumption hands out a guard so release is guaranteed
//! even on early return.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Lifecycle state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Open; operations performed while resumed belong to this batch.
    Active,
    /// Completed; committed unless previously discarded.
    Closed,
    /// Marked for rollback; the next close rolls back instead of committing.
    Discarded,
}

/// Completion hook invoked exactly once when a batch closes.
/// The argument is `true` for commit, `false` for rollback.
type CompletionHook = Box<dyn Fn(bool) + Send + Sync>;

struct BatchInner {
    state: Mutex<BatchState>,
    resumed: AtomicUsize,
    on_complete: Option<CompletionHook>,
}

/// A clonable handle to one unit of work.
#[derive(Clone)]
pub struct Batch {
    inner: Arc<BatchInner>,
}

impl Batch {
    fn new(on_complete: Option<CompletionHook>) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                state: Mutex::new(BatchState::Active),
                resumed: AtomicUsize::new(0),
                on_complete,
            }),
        }
    }

    pub fn state(&self) -> BatchState {
        *self.inner.state.lock()
    }

    /// Close the batch: commit if active, roll back if discarded. Closing an
    /// already-closed batch is a no-op.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        let committed = match *state {
            BatchState::Active => true,
            BatchState::Discarded => false,
            BatchState::Closed => return,
        };
        *state = BatchState::Closed;
        drop(state);
        trace!(committed, "batch closed");
        if let Some(hook) = &self.inner.on_complete {
            hook(committed);
        }
    }

    /// Mark the batch for rollback. No effect once closed.
    pub fn discard(&self) {
        let mut state = self.inner.state.lock();
        if *state == BatchState::Active {
            *state = BatchState::Discarded;
        }
    }

    /// How many guards currently hold this batch resumed.
    pub fn resumed_depth(&self) -> usize {
        self.inner.resumed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("state", &self.state())
            .field("resumed_depth", &self.resumed_depth())
            .finish()
    }
}

/// Scoped resumption of a batch; suspends it again on drop.
///
/// A guard over `None` is a no-op scope used when the original batch was
/// already closed or discarded.
pub struct BatchGuard {
    batch: Option<Batch>,
}

impl BatchGuard {
    pub fn batch(&self) -> Option<&Batch> {
        self.batch.as_ref()
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        if let Some(batch) = &self.batch {
            batch.inner.resumed.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Creates and resumes batches for one cache.
pub trait Batcher: Send + Sync {
    /// Create a new active batch.
    fn create_batch(&self) -> Batch;

    /// Resume an existing batch for the duration of the returned guard.
    /// `None`, or a batch that is no longer active, yields a no-op scope.
    fn resume_batch(&self, batch: Option<&Batch>) -> BatchGuard;
}

/// Batcher that tracks commit/rollback counts; sufficient for grids whose
/// transactional engine lives behind the `SessionGrid` trait.
#[derive(Debug, Default)]
pub struct SimpleBatcher {
    created: AtomicUsize,
    committed: Arc<AtomicUsize>,
    rolled_back: Arc<AtomicUsize>,
}

impl SimpleBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    pub fn committed_count(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    pub fn rolled_back_count(&self) -> usize {
        self.rolled_back.load(Ordering::Acquire)
    }
}

impl Batcher for SimpleBatcher {
    fn create_batch(&self) -> Batch {
        self.created.fetch_add(1, Ordering::AcqRel);
        let committed = self.committed.clone();
        let rolled_back = self.rolled_back.clone();
        Batch::new(Some(Box::new(move |commit| {
            if commit {
                committed.fetch_add(1, Ordering::AcqRel);
            } else {
                rolled_back.fetch_add(1, Ordering::AcqRel);
            }
        })))
    }

    fn resume_batch(&self, batch: Option<&Batch>) -> BatchGuard {
        let resumable = batch.filter(|b| b.state() == BatchState::Active).cloned();
        if let Some(batch) = &resumable {
            batch.inner.resumed.fetch_add(1, Ordering::AcqRel);
        }
        BatchGuard { batch: resumable }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_commits_once() {
        let batcher = SimpleBatcher::new();
        let batch = batcher.create_batch();
        assert_eq!(batch.state(), BatchState::Active);
        batch.close();
        batch.close();
        assert_eq!(batch.state(), BatchState::Closed);
        assert_eq!(batcher.committed_count(), 1);
        assert_eq!(batcher.rolled_back_count(), 0);
    }

    #[test]
    fn test_discard_rolls_back() {
        let batcher = SimpleBatcher::new();
        let batch = batcher.create_batch();
        batch.discard();
        assert_eq!(batch.state(), BatchState::Discarded);
        batch.close();
        assert_eq!(batcher.committed_count(), 0);
        assert_eq!(batcher.rolled_back_count(), 1);
    }

    #[test]
    fn test_resume_guard_releases_on_drop() {
        let batcher = SimpleBatcher::new();
        let batch = batcher.create_batch();
        {
            let guard = batcher.resume_batch(Some(&batch));
            assert!(guard.batch().is_some());
            assert_eq!(batch.resumed_depth(), 1);
        }
        assert_eq!(batch.resumed_depth(), 0);
    }

    #[test]
    fn test_closed_batch_resumes_as_noop() {
        let batcher = SimpleBatcher::new();
        let batch = batcher.create_batch();
        batch.close();
        let guard = batcher.resume_batch(Some(&batch));
        assert!(guard.batch().is_none());
        let guard = batcher.resume_batch(None);
        assert!(guard.batch().is_none());
    }
}
