//! Collaborator interfaces presented by the underlying replicated cache.
//!
//! The cache engine itself (storage, eviction, wire protocol) is out of
//! scope; this crate only depends on the surface below: keyed get/put/remove
//! with batch semantics, distribution introspection, local-key iteration, and
//! a topology-event subscription. Events are delivered as explicit values
//! over a channel rather than listener callbacks, so ordering and
//! back-pressure are testable without a live cluster.

pub mod batch;

use crate::topology::hash::ConsistentHashTopology;
use crate::types::{NodeId, SessionKey, TopologyId};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

pub use batch::{Batch, BatchGuard, BatchState, Batcher, SimpleBatcher};

/// Topology and rehash notifications emitted by the grid.
///
/// Both event pairs carry start/end hash snapshots and the id of the topology
/// being installed. For a given cache, events are emitted in order: pre
/// before post, and rehashes never interleave.
#[derive(Debug, Clone)]
pub enum TopologyEvent {
    /// Data movement for a new topology is about to begin.
    RehashPre {
        topology_id: TopologyId,
        start: Arc<ConsistentHashTopology>,
        end: Arc<ConsistentHashTopology>,
    },

    /// Data movement for a new topology has completed.
    RehashPost {
        topology_id: TopologyId,
        start: Arc<ConsistentHashTopology>,
        end: Arc<ConsistentHashTopology>,
    },

    /// A new topology view is about to be installed.
    TopologyChangedPre {
        topology_id: TopologyId,
        /// Read hash at the start of the change.
        start: Arc<ConsistentHashTopology>,
        /// Write hash at the end of the change.
        end: Arc<ConsistentHashTopology>,
    },

    /// A new topology view was installed. A view change without a matching
    /// rehash means primary ownership may have shifted without data movement.
    TopologyChangedPost {
        topology_id: TopologyId,
        start: Arc<ConsistentHashTopology>,
        end: Arc<ConsistentHashTopology>,
    },
}

impl TopologyEvent {
    pub fn topology_id(&self) -> TopologyId {
        match self {
            TopologyEvent::RehashPre { topology_id, .. }
            | TopologyEvent::RehashPost { topology_id, .. }
            | TopologyEvent::TopologyChangedPre { topology_id, .. }
            | TopologyEvent::TopologyChangedPost { topology_id, .. } => *topology_id,
        }
    }

    /// The hash snapshot at the end of the event.
    pub fn end_hash(&self) -> &Arc<ConsistentHashTopology> {
        match self {
            TopologyEvent::RehashPre { end, .. }
            | TopologyEvent::RehashPost { end, .. }
            | TopologyEvent::TopologyChangedPre { end, .. }
            | TopologyEvent::TopologyChangedPost { end, .. } => end,
        }
    }
}

/// The replicated cache the session subsystem is layered over.
///
/// `distribution()` returns `None` when the cache is not running in a
/// distributed mode; callers that require a hash fail fast on that.
pub trait SessionGrid: Send + Sync {
    /// Cache name, used in logs and error messages.
    fn name(&self) -> &str;

    /// The local cluster member.
    fn local_node(&self) -> NodeId;

    /// Current distribution snapshot, if the cache is distributed.
    fn distribution(&self) -> Option<Arc<ConsistentHashTopology>>;

    fn get(&self, key: &SessionKey) -> Option<Bytes>;

    /// Insert or replace, returning the previous value.
    fn put(&self, key: SessionKey, value: Bytes) -> Option<Bytes>;

    /// Remove, returning the removed value.
    fn remove(&self, key: &SessionKey) -> Option<Bytes>;

    /// Keys present on this node. With `include_passivated`, keys held only
    /// in a cache store (passivated or off-heap) are included as well.
    fn local_keys(&self, include_passivated: bool) -> Vec<SessionKey>;

    /// Subscribe to topology events. Each subscriber receives every event
    /// emitted after the point of subscription, in emission order.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<TopologyEvent>;

    /// The batcher providing transactional scoping for this cache.
    fn batcher(&self) -> Arc<dyn Batcher>;
}

/// Supplies unique raw keys, used as raw material for affinity-biased key
/// selection.
pub trait KeyGenerator: Send + Sync {
    fn generate_key(&self) -> SessionKey;
}

/// Default key generator producing random UUID-based identifiers.
#[derive(Debug, Default)]
pub struct UuidKeyGenerator;

impl KeyGenerator for UuidKeyGenerator {
    fn generate_key(&self) -> SessionKey {
        SessionKey::new(crate::types::SessionId::new(
            Uuid::new_v4().simple().to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_generator_uniqueness() {
        let generator = UuidKeyGenerator;
        let a = generator.generate_key();
        let b = generator.generate_key();
        assert_ne!(a, b);
        assert_eq!(a.id().as_str().len(), 32);
    }

    #[test]
    fn test_event_accessors() {
        let start = Arc::new(ConsistentHashTopology::balanced(1, &[1], 4, 1));
        let end = Arc::new(ConsistentHashTopology::balanced(2, &[1, 2], 4, 1));
        let event = TopologyEvent::RehashPost {
            topology_id: 2,
            start,
            end: end.clone(),
        };
        assert_eq!(event.topology_id(), 2);
        assert_eq!(event.end_hash().members(), end.members());
    }
}
