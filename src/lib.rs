//! Topology-aware HTTP session management over a distributed cache.
//!
//! Sessions live in a partitioned grid cache; this crate keeps them close to
//! the nodes that serve them and expires them exactly once, wherever their
//! data happens to land:
//!
//! - **Key affinity**: pre-generated session identifiers whose primary owner
//!   is the local node, so a session's data is born on the node serving it
//! - **Locality predicates**: cheap "is this key mine" checks against
//!   consistent-hash snapshots
//! - **Expiration scheduling**: per-session timers on the primary owner,
//!   with commands routed to the owner when another node touches a session
//! - **Topology coordination**: timers follow primary ownership across
//!   rehashes and view changes
//! - **Web-tier adapter**: batch-scoped session facade with attach/detach
//!   semantics and local-only state (auth results, websocket channels)
//!
//! # Example
//!
//! ```rust,ignore
//! use tessera::{SessionManager, SessionManagerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = SessionManager::new(grid, SessionManagerConfig::default())?;
//!     manager.start();
//!
//!     // Identifier biased so this node is its primary owner
//!     let id = manager.create_identifier().await;
//!     let session = manager.create_session(id)?;
//!     session.set_attribute("user", Some("alice".into()))?;
//!     session.request_done();
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 Web tier                    │
//! └─────────────────────────────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────────┐
//! │        SessionManager / SessionAdapter      │
//! │  • create_identifier() -> SessionId         │
//! │  • create/find session (batch-scoped)       │
//! └─────────────────────────────────────────────┘
//!        │               │               │
//!        ▼               ▼               ▼
//! ┌────────────┐  ┌─────────────┐  ┌────────────┐
//! │ KeyAffinity│  │ Expiration  │  │  Topology  │
//! │  Service   │  │ Scheduler   │  │Coordinator │
//! └────────────┘  └─────────────┘  └────────────┘
//!        │               │               │
//!        └───────────────┼───────────────┘
//!                        ▼
//! ┌─────────────────────────────────────────────┐
//! │          SessionGrid (partitioned cache)    │
//! └─────────────────────────────────────────────┘
//! ```

pub mod affinity;
pub mod config;
pub mod error;
pub mod expiration;
pub mod grid;
pub mod session;
pub mod testing;
pub mod topology;
pub mod types;

// Re-export main types for convenience
pub use config::{AffinityConfig, SessionManagerConfig, DEFAULT_SEGMENTS};
pub use error::{Error, Result};
pub use types::{NodeId, SessionId, SessionKey, TopologyId};

pub use affinity::KeyAffinityService;
pub use expiration::{CommandDispatcher, ExpirationScheduler, PrimaryOwnerScheduler, ScheduleCommand};
pub use grid::{Batch, BatchGuard, Batcher, KeyGenerator, SessionGrid, TopologyEvent, UuidKeyGenerator};
pub use session::{
    Session, SessionAdapter, SessionExpirationListener, SessionListener, SessionManager,
    SessionStore,
};
pub use topology::{
    ConsistentHashLocality, ConsistentHashTopology, CoordinatorHandle, Locality, SimpleLocality,
    TopologyChangeCoordinator,
};
