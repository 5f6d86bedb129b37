//! Cache-backed sessions: the session handle and store, the manager, and the
//! web-tier adapter.

pub mod adapter;
pub mod manager;
pub mod session;
pub mod store;

pub use adapter::SessionAdapter;
pub use manager::{SessionListener, SessionManager};
pub use session::{
    AuthenticatedSession, LocalSessionContext, Session, SessionMetadata,
    AUTHENTICATED_SESSION_ATTRIBUTE, WEB_SOCKET_CHANNELS_ATTRIBUTE,
};
pub use store::{
    ExpirationMetadata, ExpirationRemover, GridSessionStore, SessionExpirationListener,
    SessionStore,
};
