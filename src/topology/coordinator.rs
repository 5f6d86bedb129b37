//! Reaction to topology changes: moving expiration timers with ownership.
//!
//! The coordinator consumes the grid's topology events. While a rehash is in
//! flight it cancels timers for sessions this node no longer owns; once the
//! rehash (or an ownership-only view change) completes it scans the local
//! sessions and schedules timers for the ones that just became primarily
//! owned here. Scheduling passes run as abortable tasks so a newer topology
//! supersedes an unfinished pass.

use crate::expiration::ExpirationScheduler;
use crate::grid::{SessionGrid, TopologyEvent};
use crate::session::store::SessionStore;
use crate::topology::hash::ConsistentHashTopology;
use crate::topology::locality::{ConsistentHashLocality, Locality, SimpleLocality};
use crate::types::{SessionKey, TopologyId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

struct Inner {
    grid: Arc<dyn SessionGrid>,
    store: Arc<dyn SessionStore>,
    scheduler: ExpirationScheduler,

    /// Whether the cache mode moves data on membership change. Without state
    /// transfer, ownership shifts are view-only and every local session is a
    /// rescheduling candidate.
    requires_state_transfer: bool,

    /// Topology id of the rehash currently in flight; zero when none is.
    rehash_topology: AtomicU64,

    /// The running scheduling pass, replaced (and aborted) by newer passes.
    pass: Mutex<Option<JoinHandle<()>>>,
}

/// Owns the subscription to topology events for one session cache.
pub struct TopologyChangeCoordinator {
    inner: Arc<Inner>,
}

impl TopologyChangeCoordinator {
    pub fn new(
        grid: Arc<dyn SessionGrid>,
        store: Arc<dyn SessionStore>,
        scheduler: ExpirationScheduler,
        requires_state_transfer: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                grid,
                store,
                scheduler,
                requires_state_transfer,
                rehash_topology: AtomicU64::new(0),
                pass: Mutex::new(None),
            }),
        }
    }

    /// Subscribe and start consuming events.
    pub fn start(self) -> CoordinatorHandle {
        let events = self.inner.grid.subscribe();
        let task = tokio::spawn(Inner::run(self.inner.clone(), events));
        CoordinatorHandle {
            inner: self.inner,
            task,
        }
    }
}

/// Handle to a started coordinator.
pub struct CoordinatorHandle {
    inner: Arc<Inner>,
    task: JoinHandle<()>,
}

impl CoordinatorHandle {
    /// Topology id of the in-flight rehash, if one is underway.
    pub fn rehash_in_progress(&self) -> Option<TopologyId> {
        match self.inner.rehash_topology.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn stop(self) {
        self.task.abort();
        if let Some(pass) = self.inner.pass.lock().take() {
            pass.abort();
        }
        debug!("topology coordinator stopped");
    }
}

impl Inner {
    async fn run(
        inner: Arc<Inner>,
        mut events: tokio::sync::mpsc::UnboundedReceiver<TopologyEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                TopologyEvent::RehashPre {
                    topology_id, end, ..
                } => inner.rehash_started(topology_id, end),
                TopologyEvent::RehashPost {
                    topology_id,
                    start,
                    end,
                } => {
                    let _ = inner.rehash_topology.compare_exchange(
                        topology_id,
                        0,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    inner.schedule_pass(start, end);
                }
                TopologyEvent::TopologyChangedPre { .. } => {}
                TopologyEvent::TopologyChangedPost {
                    topology_id,
                    start,
                    end,
                } => {
                    // A view change matching the in-flight rehash is handled
                    // by the rehash-post event; others shifted ownership
                    // without moving data.
                    if inner.rehash_topology.load(Ordering::Acquire) != topology_id {
                        inner.schedule_pass(start, end);
                    }
                }
            }
        }
    }

    fn rehash_started(&self, topology_id: TopologyId, end: Arc<ConsistentHashTopology>) {
        trace!(topology_id, "rehash started");
        self.rehash_topology.store(topology_id, Ordering::Release);
        if self.requires_state_transfer {
            if let Some(pass) = self.pass.lock().take() {
                pass.abort();
            }
            // Sessions leaving this node mid-rehash must not fire here.
            let locality = ConsistentHashLocality::new(end, self.grid.local_node());
            self.scheduler.cancel(&locality);
        }
    }

    fn schedule_pass(&self, start: Arc<ConsistentHashTopology>, end: Arc<ConsistentHashTopology>) {
        // Without state transfer, only a member leaving can strand timers.
        if !self.requires_state_transfer && end.contains_members_of(&start) {
            return;
        }
        let local = self.grid.local_node();
        if !end.owns_primary_segments(local) {
            trace!(topology_id = end.topology_id(), "no primary segments here");
            return;
        }

        let old_locality: Arc<dyn Locality> = if self.requires_state_transfer {
            Arc::new(ConsistentHashLocality::new(start, local))
        } else {
            Arc::new(SimpleLocality(false))
        };
        let new_locality = ConsistentHashLocality::new(end.clone(), local);

        let store = self.store.clone();
        let scheduler = self.scheduler.clone();
        let topology_id = end.topology_id();
        let handle = tokio::spawn(async move {
            let mut scheduled = 0usize;
            for (scanned, id) in store.local_session_ids(true).into_iter().enumerate() {
                let key = SessionKey::new(id.clone());
                if !old_locality.is_local(&key) && new_locality.is_local(&key) {
                    if let Some(metadata) = store.expiration(&id) {
                        scheduler.schedule(id, metadata);
                        scheduled += 1;
                    }
                }
                // Yield between chunks so an abort lands promptly.
                if scanned % 64 == 63 {
                    tokio::task::yield_now().await;
                }
            }
            debug!(topology_id, scheduled, "scheduling pass complete");
        });
        if let Some(previous) = self.pass.lock().replace(handle) {
            previous.abort();
        }
    }
}
