//! Core types used throughout the session grid.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

/// Node identifier in the cluster.
///
/// Stable for the lifetime of a single topology view; a restarted member
/// rejoins under a fresh id.
pub type NodeId = u64;

/// Identifier of a consistent-hash topology snapshot.
pub type TopologyId = u64;

/// Logical session identifier, as handed to the web tier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Cache key for a session: the identifier plus the routing hash the grid
/// uses to place it on its primary owner.
///
/// The hash is computed once at construction so that ownership queries during
/// rehash passes never re-hash the identifier.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    id: SessionId,
    hash: u64,
}

impl SessionKey {
    pub fn new(id: SessionId) -> Self {
        let hash = hash_bytes(id.as_str().as_bytes());
        Self { id, hash }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn into_id(self) -> SessionId {
        self.id
    }

    /// The routing hash used for segment placement.
    pub fn routing_hash(&self) -> u64 {
        self.hash
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({} @ {:#x})", self.id, self.hash)
    }
}

impl From<SessionId> for SessionKey {
    fn from(id: SessionId) -> Self {
        Self::new(id)
    }
}

/// Hash raw bytes with xxHash64, the same function used for segment placement.
pub(crate) fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    bytes.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_hash_is_stable() {
        let a = SessionKey::new(SessionId::from("abc"));
        let b = SessionKey::new(SessionId::from("abc"));
        assert_eq!(a.routing_hash(), b.routing_hash());
        assert_eq!(a, b);
    }

    #[test]
    fn test_session_key_roundtrip() {
        let key = SessionKey::new(SessionId::from("s1"));
        let bytes = bincode::serialize(&key).unwrap();
        let decoded: SessionKey = bincode::deserialize(&bytes).unwrap();
        assert_eq!(key, decoded);
        assert_eq!(decoded.id().as_str(), "s1");
    }
}
