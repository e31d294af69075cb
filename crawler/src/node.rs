//! Nodes of key-addressed overlay networks.

use crate::kademlia::{KadPeer, Key};
use overlay_crawler_engine::{Keyed, PeerInfo};
use rand::Rng;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Identifier of a node, its position in the keyspace.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 32]);

impl NodeId {
    pub const fn new(bytes: [u8; 32]) -> Self {
        NodeId(bytes)
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill(&mut bytes);
        NodeId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns the first four bytes in hex, enough to tell nodes apart in logs.
    pub fn short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl From<Key> for NodeId {
    fn from(key: Key) -> Self {
        NodeId(*key.as_bytes())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

/// Error returned when parsing a malformed node ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseNodeIdError(String);

impl fmt::Display for ParseNodeIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid node ID '{}', expected 64 hex characters", self.0)
    }
}

impl std::error::Error for ParseNodeIdError {}

impl FromStr for NodeId {
    type Err = ParseNodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseNodeIdError(s.to_string());
        let hex = s.strip_prefix("0x").unwrap_or(s);
        if hex.len() != 64 || !hex.is_ascii() {
            return Err(invalid());
        }

        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
        }
        Ok(NodeId(bytes))
    }
}

/// A node and the addresses it was observed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    id: NodeId,
    addrs: Vec<SocketAddr>,
}

impl NodeRecord {
    pub fn new(id: NodeId, addrs: Vec<SocketAddr>) -> Self {
        NodeRecord { id, addrs }
    }

    /// Returns the record with `addrs` appended, skipping known addresses.
    pub fn with_addrs(mut self, addrs: &[SocketAddr]) -> Self {
        for addr in addrs {
            if !self.addrs.contains(addr) {
                self.addrs.push(*addr);
            }
        }
        self
    }
}

impl Keyed for NodeRecord {
    fn key(&self) -> String {
        self.id.to_string()
    }
}

impl PeerInfo for NodeRecord {
    type Id = NodeId;

    fn id(&self) -> &NodeId {
        &self.id
    }

    fn addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    /// Combines the addresses of both records.
    ///
    /// # Panics
    ///
    /// Panics if the records belong to different nodes.
    fn merge(self, other: Self) -> Self {
        assert_eq!(self.id, other.id, "merging records of different nodes");
        self.with_addrs(&other.addrs)
    }
}

impl KadPeer for NodeRecord {
    fn kad_key(&self) -> Key {
        Key::from(self.id)
    }
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} addrs)", self.id.short(), self.addrs.len())
    }
}
