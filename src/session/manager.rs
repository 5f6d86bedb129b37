//! Session manager: identifier generation, session lifecycle, and listener
//! fan-out.
//!
//! The manager ties the store, the key-affinity service, and the batcher
//! together. Every session handed out is wrapped in a [`SessionAdapter`]
//! scoped to a fresh batch; the adapter closes that batch when the request
//! completes.

use crate::affinity::KeyAffinityService;
use crate::config::SessionManagerConfig;
use crate::error::Result;
use crate::grid::{Batcher, KeyGenerator, SessionGrid, UuidKeyGenerator};
use crate::session::adapter::SessionAdapter;
use crate::session::store::{GridSessionStore, SessionStore};
use crate::types::SessionId;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Observer of session lifecycle and attribute changes.
///
/// Callbacks run on the mutating thread, before its batch closes; keep them
/// short.
pub trait SessionListener: Send + Sync {
    fn attribute_added(&self, _id: &SessionId, _name: &str, _value: &Bytes) {}

    fn attribute_updated(&self, _id: &SessionId, _name: &str, _old: &Bytes, _new: &Bytes) {}

    fn attribute_removed(&self, _id: &SessionId, _name: &str, _old: &Bytes) {}

    /// The session was explicitly invalidated. Not fired for expiration; see
    /// `SessionExpirationListener` for that.
    fn session_destroyed(&self, _id: &SessionId) {}

    fn session_id_changed(&self, _old: &SessionId, _new: &SessionId) {}
}

/// Shared listener registry; adapters fan out through this.
#[derive(Default)]
pub(crate) struct SessionListeners {
    listeners: RwLock<Vec<Arc<dyn SessionListener>>>,
}

impl SessionListeners {
    pub(crate) fn register(&self, listener: Arc<dyn SessionListener>) {
        self.listeners.write().push(listener);
    }

    pub(crate) fn attribute_added(&self, id: &SessionId, name: &str, value: &Bytes) {
        for listener in self.listeners.read().iter() {
            listener.attribute_added(id, name, value);
        }
    }

    pub(crate) fn attribute_updated(&self, id: &SessionId, name: &str, old: &Bytes, new: &Bytes) {
        for listener in self.listeners.read().iter() {
            listener.attribute_updated(id, name, old, new);
        }
    }

    pub(crate) fn attribute_removed(&self, id: &SessionId, name: &str, old: &Bytes) {
        for listener in self.listeners.read().iter() {
            listener.attribute_removed(id, name, old);
        }
    }

    pub(crate) fn session_destroyed(&self, id: &SessionId) {
        for listener in self.listeners.read().iter() {
            listener.session_destroyed(id);
        }
    }

    pub(crate) fn session_id_changed(&self, old: &SessionId, new: &SessionId) {
        for listener in self.listeners.read().iter() {
            listener.session_id_changed(old, new);
        }
    }
}

/// Manages distributable sessions over one grid cache.
pub struct SessionManager {
    grid: Arc<dyn SessionGrid>,
    store: GridSessionStore,
    affinity: Arc<KeyAffinityService>,
    generator: Arc<dyn KeyGenerator>,
    batcher: Arc<dyn Batcher>,
    listeners: Arc<SessionListeners>,
    config: SessionManagerConfig,
}

impl SessionManager {
    /// Build a manager over `grid`. Fails fast if the grid is not running in
    /// a distributed mode.
    pub fn new(grid: Arc<dyn SessionGrid>, config: SessionManagerConfig) -> Result<Self> {
        let generator: Arc<dyn KeyGenerator> = Arc::new(UuidKeyGenerator);
        let affinity = Arc::new(KeyAffinityService::new(
            grid.clone(),
            generator.clone(),
            config.affinity.clone(),
            None,
        )?);
        let store = GridSessionStore::new(grid.clone(), config.default_max_inactive);
        let batcher = grid.batcher();
        if let Some(distribution) = grid.distribution() {
            if distribution.num_segments() != config.segments {
                warn!(
                    configured = config.segments,
                    actual = distribution.num_segments(),
                    "segment count differs from the grid's hash space"
                );
            }
        }
        Ok(Self {
            grid,
            store,
            affinity,
            generator,
            batcher,
            listeners: Arc::new(SessionListeners::default()),
            config,
        })
    }

    /// Start background services.
    pub fn start(&self) {
        self.affinity.start();
        info!(cache = self.grid.name(), "session manager started");
    }

    /// Stop background services. Outstanding adapters remain usable; their
    /// batches close normally.
    pub fn stop(&self) {
        self.affinity.stop();
        info!(cache = self.grid.name(), "session manager stopped");
    }

    /// Generate an identifier for a new session, biased so that its primary
    /// owner is this node. Falls back to an unaffinitized identifier before
    /// `start` or after `stop`.
    pub async fn create_identifier(&self) -> SessionId {
        if self.affinity.is_started() {
            if let Ok(key) = self.affinity.key_for_node(self.grid.local_node()).await {
                return key.into_id();
            }
        }
        self.generator.generate_key().into_id()
    }

    /// Create a session under a fresh batch.
    pub fn create_session(&self, id: SessionId) -> Result<SessionAdapter> {
        let batch = self.batcher.create_batch();
        match self.store.create_session(id) {
            Ok(session) => {
                debug!(session = %session.id(), "created session");
                Ok(self.adapter(session, batch))
            }
            Err(e) => {
                batch.discard();
                batch.close();
                Err(e)
            }
        }
    }

    /// Look up a session under a fresh batch. An empty lookup closes its
    /// batch immediately.
    pub fn find_session(&self, id: &SessionId) -> Result<Option<SessionAdapter>> {
        let batch = self.batcher.create_batch();
        match self.store.find_session(id) {
            Ok(Some(session)) => Ok(Some(self.adapter(session, batch))),
            Ok(None) => {
                batch.close();
                Ok(None)
            }
            Err(e) => {
                batch.discard();
                batch.close();
                Err(e)
            }
        }
    }

    pub fn register_listener(&self, listener: Arc<dyn SessionListener>) {
        self.listeners.register(listener);
    }

    pub fn grid(&self) -> &Arc<dyn SessionGrid> {
        &self.grid
    }

    pub fn store(&self) -> &GridSessionStore {
        &self.store
    }

    pub fn affinity(&self) -> &Arc<KeyAffinityService> {
        &self.affinity
    }

    pub fn config(&self) -> &SessionManagerConfig {
        &self.config
    }

    fn adapter(&self, session: Arc<dyn crate::session::session::Session>, batch: crate::grid::Batch) -> SessionAdapter {
        SessionAdapter::attached(
            session,
            batch,
            self.store.clone(),
            self.batcher.clone(),
            self.listeners.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestGrid;

    fn manager() -> SessionManager {
        let grid = TestGrid::single_node(1);
        SessionManager::new(grid, SessionManagerConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_identifier_without_start_falls_back() {
        let manager = manager();
        let id = manager.create_identifier().await;
        assert_eq!(id.as_str().len(), 32);
    }

    #[tokio::test]
    async fn test_create_and_find_session() {
        let manager = manager();
        let session = manager.create_session(SessionId::from("s1")).unwrap();
        assert_eq!(session.id().as_str(), "s1");
        session.request_done();

        assert!(manager.find_session(&SessionId::from("s1")).unwrap().is_some());
        assert!(manager.find_session(&SessionId::from("nope")).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_create_rolls_back_batch() {
        let manager = manager();
        let first = manager.create_session(SessionId::from("s1")).unwrap();
        assert!(manager.create_session(SessionId::from("s1")).is_err());
        first.request_done();
    }
}
