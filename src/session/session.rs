//! The session handle and its local-only context.

use crate::error::Result;
use crate::types::SessionId;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Attribute name under which the web tier stores the authenticated session.
pub const AUTHENTICATED_SESSION_ATTRIBUTE: &str = "web.session.authenticated-session";

/// Attribute name under which the web tier stores websocket channel handles.
pub const WEB_SOCKET_CHANNELS_ATTRIBUTE: &str = "web.session.websocket-channels";

/// Replicated session metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMetadata {
    pub created: SystemTime,
    pub last_accessed: SystemTime,
    /// `None` means the session never times out.
    pub max_inactive: Option<Duration>,
}

/// An authentication result cached on a session.
///
/// Mechanisms that can re-authenticate a request on their own keep this in
/// the local context instead of replicating it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedSession {
    pub mechanism: String,
    pub data: Bytes,
}

impl AuthenticatedSession {
    pub fn new(mechanism: impl Into<String>, data: Bytes) -> Self {
        Self {
            mechanism: mechanism.into(),
            data,
        }
    }

    /// Whether this mechanism re-authenticates automatically and therefore
    /// does not need its result replicated.
    pub fn auto_reauthenticating(&self) -> bool {
        matches!(self.mechanism.as_str(), "BASIC" | "DIGEST" | "CLIENT_CERT")
    }
}

/// Node-local session state that is never replicated: the cached auth result
/// and live websocket channel handles. Survives request boundaries and
/// travels with the session id through detach/re-attach.
#[derive(Debug, Default)]
pub struct LocalSessionContext {
    authenticated: Mutex<Option<AuthenticatedSession>>,
    websocket_channels: Mutex<Option<Bytes>>,
}

impl LocalSessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn authenticated_session(&self) -> Option<AuthenticatedSession> {
        self.authenticated.lock().clone()
    }

    /// Replace the cached auth result, returning the previous one.
    pub fn set_authenticated_session(
        &self,
        auth: Option<AuthenticatedSession>,
    ) -> Option<AuthenticatedSession> {
        std::mem::replace(&mut *self.authenticated.lock(), auth)
    }

    pub fn websocket_channels(&self) -> Option<Bytes> {
        self.websocket_channels.lock().clone()
    }

    /// Replace the websocket channel handles, returning the previous value.
    pub fn set_websocket_channels(&self, channels: Option<Bytes>) -> Option<Bytes> {
        std::mem::replace(&mut *self.websocket_channels.lock(), channels)
    }

    /// Copy this context into another, used by session-id changes.
    pub fn copy_into(&self, target: &LocalSessionContext) {
        target.set_authenticated_session(self.authenticated_session());
        target.set_websocket_channels(self.websocket_channels());
    }
}

/// A logical session backed by the grid.
///
/// Operations touching replicated state return `Error::InvalidSession` when
/// the session was concurrently invalidated elsewhere; callers clean up their
/// local handle and re-raise.
pub trait Session: Send + Sync {
    fn id(&self) -> &SessionId;

    /// Whether this handle still refers to a live session.
    fn is_valid(&self) -> bool;

    fn metadata(&self) -> Result<SessionMetadata>;

    fn set_last_accessed(&self, time: SystemTime) -> Result<()>;

    fn set_max_inactive(&self, interval: Option<Duration>) -> Result<()>;

    fn attribute_names(&self) -> Result<Vec<String>>;

    fn attribute(&self, name: &str) -> Result<Option<Bytes>>;

    /// Set an attribute, returning the previous value.
    fn set_attribute(&self, name: &str, value: Bytes) -> Result<Option<Bytes>>;

    /// Remove an attribute, returning the removed value.
    fn remove_attribute(&self, name: &str) -> Result<Option<Bytes>>;

    fn local_context(&self) -> Arc<LocalSessionContext>;

    /// Remove the session from the grid. Fails with `InvalidSession` if it
    /// was already invalidated concurrently.
    fn invalidate(&self) -> Result<()>;

    /// Detach this handle from the cache; the session itself stays live.
    fn close(&self);
}
