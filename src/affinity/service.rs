//! Background key-affinity service.
//!
//! Maintains one bounded queue of pre-generated keys per interesting member.
//! A producer task continuously generates candidate keys, routes each to the
//! queue of its primary owner, and pauses on a reusable latch once every
//! queue is full. Consumers drain the queue for a target member, falling back
//! to an unaffinitized key whenever the member has no queue or owns no
//! primary segments.
//!
//! One readers/writer lock guards the member-to-queue map together with its
//! capacity counters: consumers and the producer hold it shared per
//! iteration, while a topology change takes it exclusively to drop and
//! rebuild every queue, so nobody ever observes a half-rebuilt map.

use crate::affinity::latch::ReclosableLatch;
use crate::affinity::queue::BoundedKeyQueue;
use crate::config::AffinityConfig;
use crate::error::{Error, Result};
use crate::grid::{KeyGenerator, SessionGrid, TopologyEvent};
use crate::topology::hash::ConsistentHashTopology;
use crate::types::{NodeId, SessionKey};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Fraction of a queue's capacity below which consumption re-opens the
/// producer latch.
const REFILL_THRESHOLD: f64 = 0.5;

/// Generates cache keys pre-routed to chosen cluster members.
pub struct KeyAffinityService {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    grid: Arc<dyn SessionGrid>,
    generator: Arc<dyn KeyGenerator>,
    config: AffinityConfig,

    /// Members to maintain queues for; `None` means every member.
    filter: Option<HashSet<NodeId>>,

    /// Guarded together with the two counters below by the same lock, so the
    /// invariant `max_number_of_keys == queues.len() * buffer_size` holds for
    /// every reader.
    queues: RwLock<HashMap<NodeId, Arc<BoundedKeyQueue>>>,
    max_number_of_keys: AtomicUsize,
    existing_key_count: AtomicIsize,

    latch: ReclosableLatch,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl KeyAffinityService {
    /// Create a service for the given grid.
    ///
    /// Fails fast if the grid is not running in a distributed mode; key
    /// affinity is meaningless without a distribution.
    pub fn new(
        grid: Arc<dyn SessionGrid>,
        generator: Arc<dyn KeyGenerator>,
        config: AffinityConfig,
        filter: Option<Vec<NodeId>>,
    ) -> Result<Self> {
        if grid.distribution().is_none() {
            return Err(Error::NotDistributed(grid.name().to_string()));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                grid,
                generator,
                config,
                filter: filter.map(|nodes| nodes.into_iter().collect()),
                queues: RwLock::new(HashMap::new()),
                max_number_of_keys: AtomicUsize::new(0),
                existing_key_count: AtomicIsize::new(0),
                latch: ReclosableLatch::new(),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start background key production and topology tracking.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            debug!("affinity service already started, ignoring start");
            return;
        }
        // Subscribe before the initial build so no event can fall between.
        let events = self.inner.grid.subscribe();
        if let Some(hash) = self.inner.grid.distribution() {
            self.inner.rebuild_queues(&hash);
        }

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(Inner::produce(self.inner.clone())));
        tasks.push(tokio::spawn(Inner::watch_topology(
            self.inner.clone(),
            events,
        )));
        self.inner.latch.open();
    }

    /// Halt production and drop all queues.
    pub fn stop(&self) {
        if !self.inner.started.load(Ordering::Acquire) {
            debug!("affinity service not started, ignoring stop");
            return;
        }
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.latch.open();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        debug!("affinity service stopped");
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire) && !self.inner.stopped.load(Ordering::Acquire)
    }

    /// A previously generated key whose primary owner is `node`.
    ///
    /// Waits in bounded poll slices while the producer catches up. Falls back
    /// to a freshly generated key when `node` has no queue (not interesting,
    /// or not yet built), is not a member, or owns no primary segments.
    pub async fn key_for_node(&self, node: NodeId) -> Result<SessionKey> {
        if !self.inner.started.load(Ordering::Acquire) {
            return Err(Error::NotStarted);
        }
        let inner = &self.inner;
        loop {
            if inner.stopped.load(Ordering::Acquire) {
                return Err(Error::Shutdown);
            }

            let queue;
            let mut result;
            {
                // Shared lock only for the map read and the non-blocking
                // poll; held across an await it would starve the topology
                // writer.
                let queues = inner.queues.read();
                queue = match queues.get(&node) {
                    Some(queue) => queue.clone(),
                    None => return Ok(inner.generator.generate_key()),
                };
                result = queue.poll();
                if result.is_none() {
                    // Empty queue: make sure the producer is running before
                    // we wait for it.
                    inner.latch.open();
                    let hash = inner.topology()?;
                    if !hash.contains_member(node) || !hash.owns_primary_segments(node) {
                        return Ok(inner.generator.generate_key());
                    }
                }
            }

            if result.is_none() {
                // A topology change swaps the queue map; the bounded wait
                // lets us retry against the new map.
                result = queue.poll_wait(inner.config.poll_interval).await;
            }

            if let Some(key) = result {
                inner.existing_key_count.fetch_sub(1, Ordering::AcqRel);
                trace!(node, key = %key.id(), "returning affinity key");
                if (queue.len() as f64)
                    < inner.config.buffer_size as f64 * REFILL_THRESHOLD + 1.0
                {
                    inner.latch.open();
                }
                return Ok(key);
            }
        }
    }

    /// A key colocated with the primary owner of `other`.
    pub async fn collocated_key(&self, other: &SessionKey) -> Result<SessionKey> {
        match self.inner.topology()?.primary_owner(other) {
            Some(owner) => self.key_for_node(owner).await,
            None => Ok(self.inner.generator.generate_key()),
        }
    }

    /// Total target capacity across all queues.
    pub fn max_number_of_keys(&self) -> usize {
        self.inner.max_number_of_keys.load(Ordering::Acquire)
    }

    /// Current queue length for a member, if it has a queue.
    pub fn queue_len(&self, node: NodeId) -> Option<usize> {
        self.inner.queues.read().get(&node).map(|q| q.len())
    }
}

impl Inner {
    fn topology(&self) -> Result<Arc<ConsistentHashTopology>> {
        self.grid
            .distribution()
            .ok_or_else(|| Error::NotDistributed(self.grid.name().to_string()))
    }

    fn interested(&self, node: NodeId) -> bool {
        self.filter.as_ref().map_or(true, |f| f.contains(&node))
    }

    /// Drop and rebuild every queue against `hash`. Queued keys may route to
    /// the wrong owner after a rehash, so they are discarded wholesale.
    fn rebuild_queues(&self, hash: &ConsistentHashTopology) {
        let mut queues = self.queues.write();
        queues.clear();
        for &member in hash.members() {
            if self.interested(member) && hash.owns_primary_segments(member) {
                queues.insert(member, Arc::new(BoundedKeyQueue::new(self.config.buffer_size)));
            } else {
                trace!(member, "skipping member without primary segments");
            }
        }
        self.max_number_of_keys
            .store(queues.len() * self.config.buffer_size, Ordering::Release);
        self.existing_key_count.store(0, Ordering::Release);
        trace!(
            max_number_of_keys = queues.len() * self.config.buffer_size,
            queues = queues.len(),
            "rebuilt affinity queues"
        );
    }

    /// Producer loop: wait for permission, fill queues, repeat.
    async fn produce(inner: Arc<Inner>) {
        while !inner.stopped.load(Ordering::Acquire) {
            if inner.latch.wait_timeout(inner.config.latch_timeout).await
                && !inner.stopped.load(Ordering::Acquire)
            {
                trace!("key producer active");
                inner.generate_keys();
                trace!("key producer idle");
            }
        }
        debug!("key producer shut down");
    }

    fn generate_keys(&self) {
        let queues = self.queues.read();
        // After a topology change some queues stop receiving keys; the miss
        // cap bounds how many extra keys we generate trying to fill the rest
        // before releasing the lock and retrying.
        let max_misses = self.max_number_of_keys.load(Ordering::Acquire);
        let mut misses = 0;
        // The count can dip below zero when consumers drain keys queued
        // before a rebuild reset it.
        while (self.existing_key_count.load(Ordering::Acquire).max(0) as usize)
            < self.max_number_of_keys.load(Ordering::Acquire)
            && misses <= max_misses
        {
            let key = self.generator.generate_key();
            let added = match self.grid.distribution().and_then(|t| t.primary_owner(&key)) {
                Some(owner) if self.interested(owner) => self.try_add(&queues, owner, key),
                _ => false,
            };
            if !added {
                misses += 1;
            }
        }
        if misses <= max_misses {
            self.latch.close();
        }
    }

    fn try_add(
        &self,
        queues: &HashMap<NodeId, Arc<BoundedKeyQueue>>,
        owner: NodeId,
        key: SessionKey,
    ) -> bool {
        // A stopping node may still be reported as owner after its queue was
        // removed.
        let Some(queue) = queues.get(&owner) else {
            return false;
        };
        let added = queue.offer(key);
        if added {
            self.existing_key_count.fetch_add(1, Ordering::AcqRel);
        }
        added
    }

    /// React to topology changes by dropping all queues: key routing is
    /// potentially stale after any view change.
    async fn watch_topology(
        inner: Arc<Inner>,
        mut events: tokio::sync::mpsc::UnboundedReceiver<TopologyEvent>,
    ) {
        while let Some(event) = events.recv().await {
            if inner.stopped.load(Ordering::Acquire) {
                break;
            }
            if let TopologyEvent::TopologyChangedPost { topology_id, end, .. } = event {
                trace!(topology_id, "topology changed, rebuilding affinity queues");
                inner.rebuild_queues(&end);
                inner.latch.open();
            }
        }
    }
}

impl Drop for KeyAffinityService {
    fn drop(&mut self) {
        self.inner.stopped.store(true, Ordering::Release);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
