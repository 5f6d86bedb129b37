//! Web-tier adapter over a stored session.
//!
//! An adapter starts ATTACHED to the session and the batch it was created
//! under. `request_done` closes that batch and detaches; any later
//! (out-of-band) access re-attaches under a fresh batch, once, and keeps
//! using it. Invalidity discovered mid-operation closes the current batch
//! before the error is surfaced, so no transaction is left hanging on a race
//! another node already won.

use crate::error::{Error, Result};
use crate::grid::{Batch, Batcher};
use crate::session::manager::SessionListeners;
use crate::session::session::{
    AuthenticatedSession, LocalSessionContext, Session, SessionMetadata,
    AUTHENTICATED_SESSION_ATTRIBUTE, WEB_SOCKET_CHANNELS_ATTRIBUTE,
};
use crate::session::store::{GridSessionStore, SessionStore};
use crate::types::SessionId;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, trace, warn};

enum AdapterState {
    Attached {
        session: Arc<dyn Session>,
        batch: Batch,
        oob: bool,
    },
    Detached {
        id: SessionId,
    },
}

/// Session facade handed to the web tier.
pub struct SessionAdapter {
    state: Mutex<AdapterState>,
    local: Arc<LocalSessionContext>,
    store: GridSessionStore,
    batcher: Arc<dyn Batcher>,
    listeners: Arc<SessionListeners>,
}

impl SessionAdapter {
    pub(crate) fn attached(
        session: Arc<dyn Session>,
        batch: Batch,
        store: GridSessionStore,
        batcher: Arc<dyn Batcher>,
        listeners: Arc<SessionListeners>,
    ) -> Self {
        let local = session.local_context();
        Self {
            state: Mutex::new(AdapterState::Attached {
                session,
                batch,
                oob: false,
            }),
            local,
            store,
            batcher,
            listeners,
        }
    }

    pub fn id(&self) -> SessionId {
        match &*self.state.lock() {
            AdapterState::Attached { session, .. } => session.id().clone(),
            AdapterState::Detached { id } => id.clone(),
        }
    }

    /// Whether the session is known to be valid. A detached adapter reports
    /// its last-known state; the next access re-checks against the grid.
    pub fn is_valid(&self) -> bool {
        match &*self.state.lock() {
            AdapterState::Attached { session, .. } => session.is_valid(),
            AdapterState::Detached { .. } => true,
        }
    }

    pub fn metadata(&self) -> Result<SessionMetadata> {
        self.with_session(|session| session.metadata())
    }

    pub fn set_last_accessed(&self, time: SystemTime) -> Result<()> {
        self.with_session(|session| session.set_last_accessed(time))
    }

    pub fn set_max_inactive(&self, interval: Option<Duration>) -> Result<()> {
        self.with_session(|session| session.set_max_inactive(interval))
    }

    pub fn attribute_names(&self) -> Result<Vec<String>> {
        self.with_session(|session| session.attribute_names())
    }

    pub fn attribute(&self, name: &str) -> Result<Option<Bytes>> {
        if name == WEB_SOCKET_CHANNELS_ATTRIBUTE {
            return Ok(self.local.websocket_channels());
        }
        if name == AUTHENTICATED_SESSION_ATTRIBUTE {
            // The replicated copy wins; a login recorded on another node must
            // not be masked by a locally cached one.
            if let Some(replicated) = self.with_session(|session| session.attribute(name))? {
                return Ok(Some(replicated));
            }
            if let Some(auth) = self.local.authenticated_session() {
                return Ok(Some(Bytes::from(
                    bincode::serialize(&auth).map_err(Error::from)?,
                )));
            }
            return Ok(None);
        }
        self.with_session(|session| session.attribute(name))
    }

    /// Set or remove (`None`) an attribute, returning the previous value.
    ///
    /// Websocket channels never replicate. An authenticated session whose
    /// mechanism re-authenticates on its own stays in the local context;
    /// other mechanisms replicate so a failover target can resume the login.
    pub fn set_attribute(&self, name: &str, value: Option<Bytes>) -> Result<Option<Bytes>> {
        if name == WEB_SOCKET_CHANNELS_ATTRIBUTE {
            return Ok(self.local.set_websocket_channels(value));
        }
        if name == AUTHENTICATED_SESSION_ATTRIBUTE {
            match &value {
                Some(bytes) => {
                    let auth: AuthenticatedSession =
                        bincode::deserialize(bytes).map_err(Error::from)?;
                    if auth.auto_reauthenticating() {
                        let old = self.local.set_authenticated_session(Some(auth));
                        return Ok(match old {
                            Some(old) => {
                                Some(Bytes::from(bincode::serialize(&old).map_err(Error::from)?))
                            }
                            None => None,
                        });
                    }
                    // A replicating mechanism supersedes any locally cached
                    // result.
                    self.local.set_authenticated_session(None);
                }
                None => {
                    self.local.set_authenticated_session(None);
                }
            }
        }
        match value {
            Some(value) => {
                let id = self.id();
                let old = self.with_session(|session| session.set_attribute(name, value.clone()))?;
                match &old {
                    Some(old) => self.listeners.attribute_updated(&id, name, old, &value),
                    None => self.listeners.attribute_added(&id, name, &value),
                }
                Ok(old)
            }
            None => self.remove_attribute(name),
        }
    }

    /// Remove an attribute, returning the previous value.
    pub fn remove_attribute(&self, name: &str) -> Result<Option<Bytes>> {
        if name == WEB_SOCKET_CHANNELS_ATTRIBUTE {
            return Ok(self.local.set_websocket_channels(None));
        }
        let id = self.id();
        let old = self.with_session(|session| session.remove_attribute(name))?;
        if let Some(old) = &old {
            self.listeners.attribute_removed(&id, name, old);
        }
        Ok(old)
    }

    pub fn local_context(&self) -> Arc<LocalSessionContext> {
        self.local.clone()
    }

    /// Invalidate the session and close its batch.
    ///
    /// Removal and destruction listeners run first, while the session is
    /// still valid and readable, matching servlet semantics.
    pub fn invalidate(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.attach(&mut state)?;
        let AdapterState::Attached { session, batch, .. } = &*state else {
            return Err(Error::InvalidSession(self.id_of(&state)));
        };

        if let Ok(names) = session.attribute_names() {
            for name in names {
                if let Ok(Some(value)) = session.attribute(&name) {
                    self.listeners.attribute_removed(session.id(), &name, &value);
                }
            }
        }
        self.listeners.session_destroyed(session.id());

        let guard = self.batcher.resume_batch(Some(batch));
        let result = session.invalidate();
        drop(guard);
        if let Err(e) = &result {
            if e.is_invalidity() {
                batch.discard();
            }
        }
        batch.close();

        let id = session.id().clone();
        *state = AdapterState::Detached { id: id.clone() };
        debug!(session = %id, "adapter invalidated session");
        result
    }

    /// Replace the session identifier, carrying over metadata, attributes,
    /// and the local context. On failure the batch is marked for rollback
    /// before the error is surfaced.
    pub fn change_session_id(&self, new_id: SessionId) -> Result<()> {
        let mut state = self.state.lock();
        self.attach(&mut state)?;
        let AdapterState::Attached { session, batch, oob } = &*state else {
            return Err(Error::InvalidSession(self.id_of(&state)));
        };

        let old_id = session.id().clone();
        let guard = self.batcher.resume_batch(Some(batch));
        let result = self.copy_to(session, new_id.clone());
        drop(guard);

        match result {
            Ok(replacement) => {
                let oob = *oob;
                let batch = batch.clone();
                *state = AdapterState::Attached {
                    session: replacement,
                    batch,
                    oob,
                };
                drop(state);
                self.listeners.session_id_changed(&old_id, &new_id);
                debug!(old = %old_id, new = %new_id, "session id changed");
                Ok(())
            }
            Err(e) => {
                batch.discard();
                if e.is_invalidity() {
                    batch.close();
                }
                Err(e)
            }
        }
    }

    fn copy_to(&self, session: &Arc<dyn Session>, new_id: SessionId) -> Result<Arc<dyn Session>> {
        let metadata = session.metadata()?;
        let replacement = self.store.create_session(new_id)?;
        if let Err(e) = self.copy_into(session, &replacement, metadata) {
            // Best effort; the discarded batch rolls the rest back.
            let _ = replacement.invalidate();
            return Err(e);
        }
        Ok(replacement)
    }

    fn copy_into(
        &self,
        session: &Arc<dyn Session>,
        replacement: &Arc<dyn Session>,
        metadata: SessionMetadata,
    ) -> Result<()> {
        replacement.set_last_accessed(metadata.last_accessed)?;
        replacement.set_max_inactive(metadata.max_inactive)?;
        for name in session.attribute_names()? {
            if let Some(value) = session.attribute(&name)? {
                replacement.set_attribute(&name, value)?;
            }
        }
        self.local.copy_into(&replacement.local_context());
        session.invalidate()
    }

    /// Close out the request: record the access time, close the batch, and
    /// detach. A discarded batch rolls back instead. Idempotent, and never
    /// fails; the response is already committed by the time this runs, so
    /// problems are logged and swallowed.
    pub fn request_done(&self) {
        let mut state = self.state.lock();
        let AdapterState::Attached { session, batch, .. } = &*state else {
            return;
        };

        if batch.state() == crate::grid::BatchState::Active && session.is_valid() {
            let guard = self.batcher.resume_batch(Some(batch));
            let result = session.set_last_accessed(SystemTime::now());
            drop(guard);
            if let Err(e) = result {
                // Invalidity here just means another node won a race.
                if !e.is_invalidity() {
                    warn!(session = %session.id(), error = %e, "failed to record access time");
                    batch.discard();
                }
            }
        }
        batch.close();
        session.close();
        let id = session.id().clone();
        trace!(session = %id, "request done, detaching");
        *state = AdapterState::Detached { id };
    }

    fn id_of(&self, state: &AdapterState) -> SessionId {
        match state {
            AdapterState::Attached { session, .. } => session.id().clone(),
            AdapterState::Detached { id } => id.clone(),
        }
    }

    /// Re-attach a detached adapter under a fresh batch. Out-of-band access
    /// materializes the session once and reuses it afterwards.
    fn attach(&self, state: &mut AdapterState) -> Result<()> {
        let AdapterState::Detached { id } = &*state else {
            return Ok(());
        };
        let id = id.clone();
        let batch = self.batcher.create_batch();
        match self.store.find_session(&id) {
            Ok(Some(session)) => {
                trace!(session = %id, "out-of-band re-attach");
                *state = AdapterState::Attached {
                    session,
                    batch,
                    oob: true,
                };
                Ok(())
            }
            Ok(None) => {
                batch.close();
                Err(Error::InvalidSession(id))
            }
            Err(e) => {
                batch.discard();
                batch.close();
                Err(e)
            }
        }
    }

    fn with_session<T>(&self, f: impl FnOnce(&Arc<dyn Session>) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock();
        self.attach(&mut state)?;
        let AdapterState::Attached { session, batch, .. } = &*state else {
            return Err(Error::InvalidSession(self.id_of(&state)));
        };
        let guard = self.batcher.resume_batch(Some(batch));
        let result = f(session);
        drop(guard);
        if let Err(e) = &result {
            if e.is_invalidity() {
                // The session died under us; end the batch so the
                // transaction is not left open.
                batch.discard();
                batch.close();
            }
        }
        result
    }
}
