//! Revision and file-node identifiers
//!
//! Identifiers are opaque byte strings that travel through the state files
//! as lowercase hex. The all-zero identifier of [`NODE_LEN`] bytes is the
//! null node: "no such revision" or "file absent on this side".

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Length in bytes of a full node (and of the null node)
pub const NODE_LEN: usize = 20;

/// Identifier of a changeset or a file revision
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Node(Vec<u8>);

impl Node {
    /// Create a node from raw bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// The null node
    pub fn null() -> Self {
        Self(vec![0u8; NODE_LEN])
    }

    /// Whether this is the null node
    pub fn is_null(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(|b| *b == 0)
    }

    /// Convert to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Parse from hexadecimal string
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        if hex_str.is_empty() {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        Ok(Self(hex::decode(hex_str)?))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Hex of the null node, as written for absent files
pub fn null_hex() -> String {
    hex::encode([0u8; NODE_LEN])
}

/// Key under which a path's pre-merge content is backed up.
///
/// Either the hex SHA-1 of the destination path, or the null key when the
/// file is absent on the local side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackupKey(String);

impl BackupKey {
    /// Derive the key for a destination path
    pub fn for_path(path: &str) -> Self {
        let digest = Sha1::digest(path.as_bytes());
        Self(hex::encode(digest))
    }

    /// The "file absent locally" sentinel
    pub fn null() -> Self {
        Self(null_hex())
    }

    /// Wrap a key read back from disk
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn is_null(&self) -> bool {
        self.0 == null_hex()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BackupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_hex_roundtrip() {
        let node = Node::new(vec![0xab, 0xcd, 0x01]);
        assert_eq!(node.to_hex(), "abcd01");
        assert_eq!(Node::from_hex("abcd01").unwrap(), node);
    }

    #[test]
    fn test_short_identifiers_are_accepted() {
        let node = Node::from_hex("aaaa").unwrap();
        assert_eq!(node.as_bytes(), &[0xaa, 0xaa]);
        assert!(!node.is_null());
    }

    #[test]
    fn test_empty_and_invalid_hex_rejected() {
        assert!(Node::from_hex("").is_err());
        assert!(Node::from_hex("xyz").is_err());
        assert!(Node::from_hex("abc").is_err());
    }

    #[test]
    fn test_null_node() {
        assert!(Node::null().is_null());
        assert_eq!(Node::null().to_hex(), null_hex());
        assert_eq!(null_hex().len(), NODE_LEN * 2);
    }

    #[test]
    fn test_backup_key_is_sha1_of_path() {
        let key = BackupKey::for_path("abc");
        assert_eq!(key.as_str(), "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_ne!(key, BackupKey::for_path("abd"));
        assert!(!key.is_null());
        assert!(BackupKey::null().is_null());
    }
}
