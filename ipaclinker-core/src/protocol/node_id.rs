use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Longest identifier the registry accepts, counted in characters.
pub const MAX_ID_LEN: usize = 22;

const BASE58: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Opaque name of a server or client endpoint in the registry.
///
/// Server identities are unique across the registry, and so are client
/// identities. Nothing else is assumed about the content.
///
/// # Examples
///
/// ```rust
/// use ipaclinker_core::protocol::node_id::NodeId;
///
/// let id = NodeId::new("S1").unwrap();
/// assert_eq!(id.as_str(), "S1");
/// assert!(NodeId::new("x".repeat(23)).is_err());
/// ```
#[derive(Hash, Eq, PartialEq, Ord, PartialOrd, Clone, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Validates the length limit and wraps the identifier.
    pub fn new<S: Into<String>>(id: S) -> Result<NodeId, ProtocolError> {
        let id = id.into();
        if id.chars().count() > MAX_ID_LEN {
            return Err(ProtocolError::IdentifierTooLong(id));
        }
        Ok(NodeId(id))
    }

    /// Generates a fresh 22 character base58 identity.
    ///
    /// ```rust
    /// use ipaclinker_core::protocol::node_id::{NodeId, MAX_ID_LEN};
    ///
    /// let id = NodeId::random();
    /// assert_eq!(id.len(), MAX_ID_LEN);
    /// ```
    pub fn random() -> NodeId {
        let mut rng = rand::thread_rng();
        let id = (0..MAX_ID_LEN)
            .map(|_| BASE58[rng.gen_range(0..BASE58.len())] as char)
            .collect();
        NodeId(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for NodeId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// Hash and Eq come from the inner string, so lookups by `&str` agree.
impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for NodeId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        NodeId::new(value)
    }
}

impl TryFrom<&str> for NodeId {
    type Error = ProtocolError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        NodeId::new(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_length_limit() {
        assert!(NodeId::new("a".repeat(MAX_ID_LEN)).is_ok());
        assert_eq!(
            NodeId::new("a".repeat(MAX_ID_LEN + 1)),
            Err(ProtocolError::IdentifierTooLong("a".repeat(MAX_ID_LEN + 1)))
        );
        // characters, not bytes
        assert!(NodeId::new("节".repeat(MAX_ID_LEN)).is_ok());
    }

    #[test]
    fn test_random_alphabet() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert_ne!(a, b);
        assert!(a.bytes().all(|c| BASE58.contains(&c)));
    }

    #[test]
    fn test_lookup_by_str() {
        let mut ids = std::collections::HashSet::new();
        ids.insert(NodeId::new("C1").unwrap());
        assert!(ids.contains("C1"));
        assert!(!ids.contains("C2"));
    }
}
