//! Testing utilities for the session grid.
//!
//! Provides an in-memory [`TestGrid`] that implements the full grid surface
//! (storage, distribution snapshots, topology events, batching) without a
//! cluster, plus a loopback command dispatcher and wait helpers. Multi-node
//! scenarios share one backing store across peers created with
//! [`TestGrid::peer`], so a rehash can be driven by installing a new topology
//! on the shared state.

mod lifecycle_tests;
mod rehash_tests;

use crate::expiration::{CommandDispatcher, ExpirationScheduler, ScheduleCommand};
use crate::grid::{Batcher, SessionGrid, SimpleBatcher, TopologyEvent};
use crate::session::store::{from_epoch_ms, ExpirationMetadata};
use crate::topology::ConsistentHashTopology;
use crate::types::{NodeId, SessionKey};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Install a formatted log subscriber once per test binary. Later calls are
/// no-ops.
#[cfg(test)]
pub(crate) fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .try_init();
}

struct GridShared {
    name: String,
    data: RwLock<HashMap<SessionKey, Bytes>>,
    passivated: RwLock<HashSet<SessionKey>>,
    topology: RwLock<Option<Arc<ConsistentHashTopology>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TopologyEvent>>>,
    batcher: Arc<SimpleBatcher>,
}

/// In-memory stand-in for a distributed cache node.
pub struct TestGrid {
    local_node: NodeId,
    shared: Arc<GridShared>,
}

impl TestGrid {
    /// A one-member distributed grid; every key is primarily owned locally.
    pub fn single_node(node: NodeId) -> Arc<Self> {
        Self::with_topology(node, Arc::new(ConsistentHashTopology::balanced(1, &[node], 16, 1)))
    }

    pub fn with_topology(local_node: NodeId, topology: Arc<ConsistentHashTopology>) -> Arc<Self> {
        Arc::new(Self {
            local_node,
            shared: Arc::new(GridShared {
                name: "web-sessions".to_string(),
                data: RwLock::new(HashMap::new()),
                passivated: RwLock::new(HashSet::new()),
                topology: RwLock::new(Some(topology)),
                subscribers: Mutex::new(Vec::new()),
                batcher: Arc::new(SimpleBatcher::new()),
            }),
        })
    }

    /// A grid with no distribution, as a local or invalidation cache mode
    /// reports.
    pub fn non_distributed(local_node: NodeId) -> Arc<Self> {
        Arc::new(Self {
            local_node,
            shared: Arc::new(GridShared {
                name: "web-sessions".to_string(),
                data: RwLock::new(HashMap::new()),
                passivated: RwLock::new(HashSet::new()),
                topology: RwLock::new(None),
                subscribers: Mutex::new(Vec::new()),
                batcher: Arc::new(SimpleBatcher::new()),
            }),
        })
    }

    /// Another member's view of the same cache: shared data, shared topology,
    /// shared event stream.
    pub fn peer(&self, local_node: NodeId) -> Arc<Self> {
        Arc::new(Self {
            local_node,
            shared: self.shared.clone(),
        })
    }

    pub fn topology(&self) -> Option<Arc<ConsistentHashTopology>> {
        self.shared.topology.read().clone()
    }

    /// Install a new topology and emit the view-change event pair.
    pub fn install_topology(&self, next: Arc<ConsistentHashTopology>) {
        let start = self.replace_topology(next.clone());
        let topology_id = next.topology_id();
        self.emit(TopologyEvent::TopologyChangedPre {
            topology_id,
            start: start.clone(),
            end: next.clone(),
        });
        self.emit(TopologyEvent::TopologyChangedPost {
            topology_id,
            start,
            end: next,
        });
    }

    /// Install a new topology with data movement: rehash-pre, the view-change
    /// pair, then rehash-post, matching the order a state transfer produces.
    pub fn install_rehash(&self, next: Arc<ConsistentHashTopology>) {
        let start = self.replace_topology(next.clone());
        let topology_id = next.topology_id();
        self.emit(TopologyEvent::RehashPre {
            topology_id,
            start: start.clone(),
            end: next.clone(),
        });
        self.emit(TopologyEvent::TopologyChangedPre {
            topology_id,
            start: start.clone(),
            end: next.clone(),
        });
        self.emit(TopologyEvent::TopologyChangedPost {
            topology_id,
            start: start.clone(),
            end: next.clone(),
        });
        self.emit(TopologyEvent::RehashPost {
            topology_id,
            start,
            end: next,
        });
    }

    pub fn emit(&self, event: TopologyEvent) {
        self.shared
            .subscribers
            .lock()
            .retain(|sender| sender.send(event.clone()).is_ok());
    }

    /// Mark a key as passivated: present, but only visible to local-key
    /// iteration when passivated keys are requested.
    pub fn mark_passivated(&self, key: &SessionKey) {
        self.shared.passivated.write().insert(key.clone());
    }

    pub fn len(&self) -> usize {
        self.shared.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.data.read().is_empty()
    }

    pub fn simple_batcher(&self) -> Arc<SimpleBatcher> {
        self.shared.batcher.clone()
    }

    fn replace_topology(&self, next: Arc<ConsistentHashTopology>) -> Arc<ConsistentHashTopology> {
        let mut topology = self.shared.topology.write();
        let start = topology.clone().unwrap_or_else(|| next.clone());
        *topology = Some(next);
        start
    }
}

impl SessionGrid for TestGrid {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn local_node(&self) -> NodeId {
        self.local_node
    }

    fn distribution(&self) -> Option<Arc<ConsistentHashTopology>> {
        self.shared.topology.read().clone()
    }

    fn get(&self, key: &SessionKey) -> Option<Bytes> {
        self.shared.data.read().get(key).cloned()
    }

    fn put(&self, key: SessionKey, value: Bytes) -> Option<Bytes> {
        self.shared.data.write().insert(key, value)
    }

    fn remove(&self, key: &SessionKey) -> Option<Bytes> {
        self.shared.passivated.write().remove(key);
        self.shared.data.write().remove(key)
    }

    fn local_keys(&self, include_passivated: bool) -> Vec<SessionKey> {
        let topology = self.shared.topology.read().clone();
        let passivated = self.shared.passivated.read();
        self.shared
            .data
            .read()
            .keys()
            .filter(|key| match &topology {
                Some(topology) => topology.primary_owner(key) == Some(self.local_node),
                None => true,
            })
            .filter(|key| include_passivated || !passivated.contains(*key))
            .cloned()
            .collect()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TopologyEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.shared.subscribers.lock().push(sender);
        receiver
    }

    fn batcher(&self) -> Arc<dyn Batcher> {
        self.shared.batcher.clone()
    }
}

/// Dispatcher that applies commands straight to registered peer schedulers,
/// recording each send.
#[derive(Default)]
pub struct LoopbackDispatcher {
    peers: Mutex<HashMap<NodeId, ExpirationScheduler>>,
    sent: Mutex<Vec<(NodeId, ScheduleCommand)>>,
}

impl LoopbackDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: NodeId, scheduler: ExpirationScheduler) {
        self.peers.lock().insert(node, scheduler);
    }

    pub fn sent(&self) -> Vec<(NodeId, ScheduleCommand)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl CommandDispatcher for LoopbackDispatcher {
    async fn dispatch(&self, target: NodeId, command: ScheduleCommand) -> crate::error::Result<()> {
        self.sent.lock().push((target, command.clone()));
        let scheduler = self.peers.lock().get(&target).cloned();
        let Some(scheduler) = scheduler else {
            return Err(crate::error::Error::Dispatch {
                node: target,
                reason: "unknown member".to_string(),
            });
        };
        match command {
            ScheduleCommand::Schedule {
                id,
                last_accessed_ms,
                max_inactive_ms,
            } => scheduler.schedule(
                id,
                ExpirationMetadata {
                    last_accessed: from_epoch_ms(last_accessed_ms),
                    max_inactive: max_inactive_ms.map(Duration::from_millis),
                },
            ),
            ScheduleCommand::Cancel { id } => scheduler.cancel_session(&id),
        }
        Ok(())
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_for<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// A key whose primary owner under `topology` is `node`. Search is bounded;
/// panics if no such key turns up, which only happens when `node` owns no
/// primary segments.
pub fn key_owned_by(topology: &ConsistentHashTopology, node: NodeId) -> SessionKey {
    for i in 0..100_000 {
        let key = SessionKey::new(crate::types::SessionId::from(format!("key-{i}")));
        if topology.primary_owner(&key) == Some(node) {
            return key;
        }
    }
    panic!("no key found with primary owner {node}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_peers_share_data() {
        let topology = Arc::new(ConsistentHashTopology::balanced(1, &[1, 2], 16, 1));
        let a = TestGrid::with_topology(1, topology);
        let b = a.peer(2);

        let key = SessionKey::new(crate::types::SessionId::from("s1"));
        a.put(key.clone(), Bytes::from_static(b"v"));
        assert_eq!(b.get(&key), Some(Bytes::from_static(b"v")));
    }

    #[tokio::test]
    async fn test_local_keys_follow_ownership() {
        let topology = Arc::new(ConsistentHashTopology::balanced(1, &[1, 2], 16, 1));
        let a = TestGrid::with_topology(1, topology.clone());
        let b = a.peer(2);

        let mine = key_owned_by(&topology, 1);
        let theirs = key_owned_by(&topology, 2);
        a.put(mine.clone(), Bytes::from_static(b"x"));
        a.put(theirs.clone(), Bytes::from_static(b"y"));

        assert_eq!(a.local_keys(true), vec![mine.clone()]);
        assert_eq!(b.local_keys(true), vec![theirs]);

        a.mark_passivated(&mine);
        assert!(a.local_keys(false).is_empty());
        assert_eq!(a.local_keys(true), vec![mine]);
    }

    #[tokio::test]
    async fn test_install_rehash_event_order() {
        let grid = TestGrid::single_node(1);
        let mut events = grid.subscribe();
        grid.install_rehash(Arc::new(ConsistentHashTopology::balanced(2, &[1, 2], 16, 1)));

        assert!(matches!(events.recv().await, Some(TopologyEvent::RehashPre { .. })));
        assert!(matches!(
            events.recv().await,
            Some(TopologyEvent::TopologyChangedPre { .. })
        ));
        assert!(matches!(
            events.recv().await,
            Some(TopologyEvent::TopologyChangedPost { .. })
        ));
        assert!(matches!(events.recv().await, Some(TopologyEvent::RehashPost { .. })));
    }
}
