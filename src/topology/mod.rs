//! Consistent-hash topology snapshots, locality predicates, and the
//! topology-change coordinator.

pub mod coordinator;
pub mod hash;
pub mod locality;

pub use coordinator::{CoordinatorHandle, TopologyChangeCoordinator};
pub use hash::ConsistentHashTopology;
pub use locality::{ConsistentHashLocality, Locality, SimpleLocality};
