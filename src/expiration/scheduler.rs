//! Per-session expiration timers.
//!
//! One tokio timer task per scheduled session. Rescheduling replaces the
//! previous timer; a generation counter makes firing exactly-once even when
//! an aborted timer races its replacement, because only the task whose
//! generation still sits in the table may remove the entry and fire.

use crate::session::store::{ExpirationMetadata, ExpirationRemover};
use crate::topology::Locality;
use crate::types::{SessionId, SessionKey};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

struct ScheduledEntry {
    generation: u64,
    key: SessionKey,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduledEntry {
    fn abort(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

struct SchedulerInner {
    remover: Arc<dyn ExpirationRemover>,
    entries: DashMap<SessionId, Arc<ScheduledEntry>>,
    generation: AtomicU64,
    shutdown: AtomicBool,
}

/// Schedules expiration timers for locally-owned sessions.
#[derive(Clone)]
pub struct ExpirationScheduler {
    inner: Arc<SchedulerInner>,
}

impl ExpirationScheduler {
    pub fn new(remover: Arc<dyn ExpirationRemover>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                remover,
                entries: DashMap::new(),
                generation: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Schedule (or reschedule) expiration of one session. A session without
    /// a deadline has any existing timer cancelled instead.
    pub fn schedule(&self, id: SessionId, metadata: ExpirationMetadata) {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        let Some(deadline) = metadata.deadline() else {
            self.cancel_session(&id);
            return;
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let entry = Arc::new(ScheduledEntry {
            generation,
            key: SessionKey::new(id.clone()),
            handle: Mutex::new(None),
        });
        if let Some(old) = self.inner.entries.insert(id.clone(), entry.clone()) {
            old.abort();
        }
        trace!(session = %id, generation, "scheduled expiration");

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let delay = deadline
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO);
            tokio::time::sleep(delay).await;
            // Only the generation still in the table may fire; a stale timer
            // that lost a reschedule race finds a newer generation and stops.
            let won = inner
                .entries
                .remove_if(&id, |_, e| e.generation == generation)
                .is_some();
            if won {
                debug!(session = %id, "session expired");
                inner.remover.remove_expired(&id);
            }
        });
        // The timer may already have fired; storing the handle on a detached
        // entry is harmless.
        *entry.handle.lock() = Some(handle);
    }

    /// Cancel the timer for one session, if any.
    pub fn cancel_session(&self, id: &SessionId) {
        if let Some((_, entry)) = self.inner.entries.remove(id) {
            entry.abort();
            trace!(session = %id, "cancelled expiration");
        }
    }

    /// Cancel every timer for sessions that are no longer local under
    /// `locality`. Used when ownership moves away during a rehash.
    pub fn cancel(&self, locality: &dyn Locality) {
        let stale: Vec<SessionId> = self
            .inner
            .entries
            .iter()
            .filter(|entry| !locality.is_local(&entry.value().key))
            .map(|entry| entry.key().clone())
            .collect();
        for id in stale {
            self.cancel_session(&id);
        }
    }

    /// Session ids with a live timer.
    pub fn scheduled_ids(&self) -> Vec<SessionId> {
        self.inner
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.inner.entries.contains_key(id)
    }

    /// Drop all timers and refuse further scheduling.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let ids = self.scheduled_ids();
        for id in ids {
            self.cancel_session(&id);
        }
        debug!("expiration scheduler shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::SimpleLocality;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingRemover {
        removed: Mutex<Vec<SessionId>>,
        calls: AtomicUsize,
    }

    impl ExpirationRemover for RecordingRemover {
        fn remove_expired(&self, id: &SessionId) -> bool {
            self.calls.fetch_add(1, Ordering::AcqRel);
            self.removed.lock().push(id.clone());
            true
        }
    }

    fn meta(max_inactive: Option<Duration>) -> ExpirationMetadata {
        ExpirationMetadata {
            last_accessed: SystemTime::now(),
            max_inactive,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once() {
        let remover = Arc::new(RecordingRemover::default());
        let scheduler = ExpirationScheduler::new(remover.clone());

        scheduler.schedule(SessionId::from("s1"), meta(Some(Duration::from_secs(1))));
        assert!(scheduler.contains(&SessionId::from("s1")));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(remover.calls.load(Ordering::Acquire), 1);
        assert!(!scheduler.contains(&SessionId::from("s1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_timer() {
        let remover = Arc::new(RecordingRemover::default());
        let scheduler = ExpirationScheduler::new(remover.clone());

        scheduler.schedule(SessionId::from("s1"), meta(Some(Duration::from_secs(1))));
        scheduler.schedule(SessionId::from("s1"), meta(Some(Duration::from_secs(10))));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(remover.calls.load(Ordering::Acquire), 0);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(remover.calls.load(Ordering::Acquire), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_deadline_cancels() {
        let remover = Arc::new(RecordingRemover::default());
        let scheduler = ExpirationScheduler::new(remover.clone());

        scheduler.schedule(SessionId::from("s1"), meta(Some(Duration::from_secs(1))));
        scheduler.schedule(SessionId::from("s1"), meta(None));
        assert!(!scheduler.contains(&SessionId::from("s1")));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(remover.calls.load(Ordering::Acquire), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_never_schedules() {
        let remover = Arc::new(RecordingRemover::default());
        let scheduler = ExpirationScheduler::new(remover.clone());

        scheduler.schedule(SessionId::from("s1"), meta(Some(Duration::ZERO)));
        assert!(!scheduler.contains(&SessionId::from("s1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_by_locality() {
        let remover = Arc::new(RecordingRemover::default());
        let scheduler = ExpirationScheduler::new(remover.clone());

        scheduler.schedule(SessionId::from("s1"), meta(Some(Duration::from_secs(60))));
        scheduler.schedule(SessionId::from("s2"), meta(Some(Duration::from_secs(60))));

        // Nothing is local anymore; all timers go.
        scheduler.cancel(&SimpleLocality(false));
        assert!(scheduler.scheduled_ids().is_empty());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(remover.calls.load(Ordering::Acquire), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_refuses_new_timers() {
        let remover = Arc::new(RecordingRemover::default());
        let scheduler = ExpirationScheduler::new(remover.clone());

        scheduler.schedule(SessionId::from("s1"), meta(Some(Duration::from_secs(1))));
        scheduler.shutdown();
        scheduler.schedule(SessionId::from("s2"), meta(Some(Duration::from_secs(1))));
        assert!(scheduler.scheduled_ids().is_empty());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(remover.calls.load(Ordering::Acquire), 0);
    }
}
