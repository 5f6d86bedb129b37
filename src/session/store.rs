//! Grid-backed session store.
//!
//! Session records are stored in the grid as marshalled bytes keyed by
//! `SessionKey`; attribute values stay opaque (marshalling is the caller's
//! concern). Local contexts live in a node-local table keyed by session id
//! and are never replicated.

use crate::error::{Error, Result};
use crate::grid::SessionGrid;
use crate::session::session::{LocalSessionContext, Session, SessionMetadata};
use crate::types::{SessionId, SessionKey};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

/// Replicated representation of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionRecord {
    created_ms: u64,
    last_accessed_ms: u64,
    max_inactive_ms: Option<u64>,
    attributes: BTreeMap<String, Vec<u8>>,
}

impl SessionRecord {
    fn new(now: SystemTime, max_inactive: Option<Duration>) -> Self {
        let now_ms = epoch_ms(now);
        Self {
            created_ms: now_ms,
            last_accessed_ms: now_ms,
            max_inactive_ms: max_inactive.map(|d| d.as_millis() as u64),
            attributes: BTreeMap::new(),
        }
    }

    fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn metadata(&self) -> SessionMetadata {
        SessionMetadata {
            created: from_epoch_ms(self.created_ms),
            last_accessed: from_epoch_ms(self.last_accessed_ms),
            max_inactive: self.max_inactive_ms.map(Duration::from_millis),
        }
    }
}

pub(crate) fn epoch_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

pub(crate) fn from_epoch_ms(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

/// The inputs the expiration scheduler derives a deadline from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationMetadata {
    pub last_accessed: SystemTime,
    pub max_inactive: Option<Duration>,
}

impl ExpirationMetadata {
    /// The instant at which the session expires; `None` for immortal
    /// sessions.
    pub fn deadline(&self) -> Option<SystemTime> {
        self.max_inactive
            .filter(|d| !d.is_zero())
            .map(|d| self.last_accessed + d)
    }
}

/// Store collaborator exposed to the manager and the scheduler.
pub trait SessionStore: Send + Sync {
    fn create_session(&self, id: SessionId) -> Result<Arc<dyn Session>>;

    fn find_session(&self, id: &SessionId) -> Result<Option<Arc<dyn Session>>>;

    /// Expiration inputs for a stored session, if it exists.
    fn expiration(&self, id: &SessionId) -> Option<ExpirationMetadata>;

    /// All locally-present session ids; with `include_passivated`, ids held
    /// only in a cache store are included too.
    fn local_session_ids(&self, include_passivated: bool) -> Vec<SessionId>;
}

/// Removal path invoked by the expiration scheduler.
pub trait ExpirationRemover: Send + Sync {
    /// Remove an expired session. Returns `false` if it was already removed
    /// or invalidated concurrently; that is a no-op, not an error.
    fn remove_expired(&self, id: &SessionId) -> bool;
}

/// Notified after a session is removed because it expired.
pub trait SessionExpirationListener: Send + Sync {
    fn session_expired(&self, id: &SessionId);
}

struct StoreInner {
    grid: Arc<dyn SessionGrid>,
    default_max_inactive: Option<Duration>,
    local_contexts: DashMap<SessionId, Arc<LocalSessionContext>>,
    expiration_listeners: RwLock<Vec<Arc<dyn SessionExpirationListener>>>,
}

/// Session store over any `SessionGrid`. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct GridSessionStore {
    inner: Arc<StoreInner>,
}

impl GridSessionStore {
    pub fn new(grid: Arc<dyn SessionGrid>, default_max_inactive: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                grid,
                default_max_inactive,
                local_contexts: DashMap::new(),
                expiration_listeners: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn register_expiration_listener(&self, listener: Arc<dyn SessionExpirationListener>) {
        self.inner.expiration_listeners.write().push(listener);
    }

    fn session(&self, key: SessionKey) -> Arc<dyn Session> {
        let local = self.inner.local_context(key.id());
        Arc::new(GridSession {
            store: self.inner.clone(),
            key,
            valid: AtomicBool::new(true),
            local,
        })
    }
}

impl StoreInner {
    fn local_context(&self, id: &SessionId) -> Arc<LocalSessionContext> {
        self.local_contexts
            .entry(id.clone())
            .or_insert_with(|| Arc::new(LocalSessionContext::new()))
            .clone()
    }
}

impl SessionStore for GridSessionStore {
    fn create_session(&self, id: SessionId) -> Result<Arc<dyn Session>> {
        let key = SessionKey::new(id);
        if self.inner.grid.get(&key).is_some() {
            return Err(Error::SessionExists(key.into_id()));
        }
        let record = SessionRecord::new(SystemTime::now(), self.inner.default_max_inactive);
        self.inner.grid.put(key.clone(), record.to_bytes()?);
        // A reused id must not inherit the previous session's local context.
        self.inner.local_contexts.remove(key.id());
        trace!(session = %key.id(), "created session");
        Ok(self.session(key))
    }

    fn find_session(&self, id: &SessionId) -> Result<Option<Arc<dyn Session>>> {
        let key = SessionKey::new(id.clone());
        if self.inner.grid.get(&key).is_none() {
            self.inner.local_contexts.remove(key.id());
            return Ok(None);
        }
        Ok(Some(self.session(key)))
    }

    fn expiration(&self, id: &SessionId) -> Option<ExpirationMetadata> {
        let key = SessionKey::new(id.clone());
        let bytes = self.inner.grid.get(&key)?;
        let record = SessionRecord::from_bytes(&bytes).ok()?;
        let metadata = record.metadata();
        Some(ExpirationMetadata {
            last_accessed: metadata.last_accessed,
            max_inactive: metadata.max_inactive,
        })
    }

    fn local_session_ids(&self, include_passivated: bool) -> Vec<SessionId> {
        self.inner
            .grid
            .local_keys(include_passivated)
            .into_iter()
            .map(SessionKey::into_id)
            .collect()
    }
}

impl ExpirationRemover for GridSessionStore {
    fn remove_expired(&self, id: &SessionId) -> bool {
        let key = SessionKey::new(id.clone());
        if self.inner.grid.remove(&key).is_none() {
            // Already invalidated or expired elsewhere.
            self.inner.local_contexts.remove(id);
            trace!(session = %id, "expired session already removed");
            return false;
        }
        self.inner.local_contexts.remove(id);
        debug!(session = %id, "removed expired session");
        for listener in self.inner.expiration_listeners.read().iter() {
            listener.session_expired(id);
        }
        true
    }
}

/// Handle to one stored session. Mutations are write-through: each operation
/// re-reads the record, applies the change, and stores it back within the
/// caller's batch scope.
struct GridSession {
    store: Arc<StoreInner>,
    key: SessionKey,
    valid: AtomicBool,
    local: Arc<LocalSessionContext>,
}

impl GridSession {
    fn load(&self) -> Result<SessionRecord> {
        if !self.valid.load(Ordering::Acquire) {
            return Err(Error::InvalidSession(self.key.id().clone()));
        }
        match self.store.grid.get(&self.key) {
            Some(bytes) => SessionRecord::from_bytes(&bytes),
            None => {
                // Invalidated concurrently on another node.
                self.valid.store(false, Ordering::Release);
                self.store.local_contexts.remove(self.key.id());
                Err(Error::InvalidSession(self.key.id().clone()))
            }
        }
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut SessionRecord) -> T) -> Result<T> {
        let mut record = self.load()?;
        let result = f(&mut record);
        self.store.grid.put(self.key.clone(), record.to_bytes()?);
        Ok(result)
    }
}

impl Session for GridSession {
    fn id(&self) -> &SessionId {
        self.key.id()
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn metadata(&self) -> Result<SessionMetadata> {
        Ok(self.load()?.metadata())
    }

    fn set_last_accessed(&self, time: SystemTime) -> Result<()> {
        self.mutate(|record| record.last_accessed_ms = epoch_ms(time))
    }

    fn set_max_inactive(&self, interval: Option<Duration>) -> Result<()> {
        self.mutate(|record| {
            record.max_inactive_ms = interval.map(|d| d.as_millis() as u64);
        })
    }

    fn attribute_names(&self) -> Result<Vec<String>> {
        Ok(self.load()?.attributes.keys().cloned().collect())
    }

    fn attribute(&self, name: &str) -> Result<Option<Bytes>> {
        Ok(self.load()?.attributes.get(name).cloned().map(Bytes::from))
    }

    fn set_attribute(&self, name: &str, value: Bytes) -> Result<Option<Bytes>> {
        self.mutate(|record| {
            record
                .attributes
                .insert(name.to_string(), value.to_vec())
                .map(Bytes::from)
        })
    }

    fn remove_attribute(&self, name: &str) -> Result<Option<Bytes>> {
        self.mutate(|record| record.attributes.remove(name).map(Bytes::from))
    }

    fn local_context(&self) -> Arc<LocalSessionContext> {
        self.local.clone()
    }

    fn invalidate(&self) -> Result<()> {
        if !self.valid.swap(false, Ordering::AcqRel) {
            return Err(Error::InvalidSession(self.key.id().clone()));
        }
        if self.store.grid.remove(&self.key).is_none() {
            // Lost the race to a concurrent invalidation.
            self.store.local_contexts.remove(self.key.id());
            return Err(Error::InvalidSession(self.key.id().clone()));
        }
        self.store.local_contexts.remove(self.key.id());
        debug!(session = %self.key.id(), "session invalidated");
        Ok(())
    }

    fn close(&self) {
        trace!(session = %self.key.id(), "session handle closed");
    }
}
