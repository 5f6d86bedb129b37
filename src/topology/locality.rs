//! Locality predicates: "is this key owned by the local member under a given
//! topology?"

use crate::error::{Error, Result};
use crate::grid::SessionGrid;
use crate::topology::hash::ConsistentHashTopology;
use crate::types::{NodeId, SessionKey};
use std::sync::Arc;

/// Predicate answering whether a key is locally owned, closed over one
/// topology snapshot (or a constant).
pub trait Locality: Send + Sync {
    fn is_local(&self, key: &SessionKey) -> bool;
}

/// Constant locality, used where ownership is not derived from a hash:
/// `SimpleLocality(false)` treats everything as newly local during a
/// scheduling pass, `SimpleLocality(true)` cancels nothing.
#[derive(Debug, Clone, Copy)]
pub struct SimpleLocality(pub bool);

impl Locality for SimpleLocality {
    fn is_local(&self, _key: &SessionKey) -> bool {
        self.0
    }
}

/// Locality derived from a consistent-hash snapshot: a key is local iff its
/// primary owner under the snapshot is the local member.
#[derive(Debug, Clone)]
pub struct ConsistentHashLocality {
    topology: Arc<ConsistentHashTopology>,
    local_node: NodeId,
}

impl ConsistentHashLocality {
    /// Close over the grid's current distribution snapshot.
    ///
    /// Fails fast if the grid has no distribution (non-distributed cache
    /// mode); silently misrouting would break the at-most-once expiration
    /// guarantee.
    pub fn from_grid(grid: &dyn SessionGrid) -> Result<Self> {
        let topology = grid
            .distribution()
            .ok_or_else(|| Error::NotDistributed(grid.name().to_string()))?;
        Ok(Self::new(topology, grid.local_node()))
    }

    /// Close over an explicit snapshot, e.g. the start or end hash of a
    /// rehash event.
    pub fn new(topology: Arc<ConsistentHashTopology>, local_node: NodeId) -> Self {
        Self {
            topology,
            local_node,
        }
    }

    pub fn topology(&self) -> &ConsistentHashTopology {
        &self.topology
    }
}

impl Locality for ConsistentHashLocality {
    fn is_local(&self, key: &SessionKey) -> bool {
        self.topology.primary_owner(key) == Some(self.local_node)
    }
}
