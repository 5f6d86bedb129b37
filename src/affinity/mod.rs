//! Key-affinity generation: pre-computed cache keys whose primary owner is a
//! chosen cluster member, so session data lands next to the node that will
//! serve it.

pub mod latch;
pub mod queue;
pub mod service;

pub use latch::ReclosableLatch;
pub use queue::BoundedKeyQueue;
pub use service::KeyAffinityService;
