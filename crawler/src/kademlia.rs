//! Keys of a Kademlia-style keyspace.

use crate::node::NodeId;
use overlay_crawler_engine::PeerInfo;
use rand::Rng;
use std::fmt;

/// A 256 bit point in the keyspace.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key([u8; Key::BYTES]);

impl Key {
    /// The size of a key in bytes.
    pub const BYTES: usize = 32;

    /// The size of a key in bits.
    pub const BITS: usize = Self::BYTES * 8;

    pub const fn new(bytes: [u8; Self::BYTES]) -> Self {
        Key(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; Self::BYTES] {
        &self.0
    }

    /// Generates a uniformly random key.
    pub fn random() -> Self {
        let mut bytes = [0u8; Self::BYTES];
        rand::thread_rng().fill(&mut bytes);
        Key(bytes)
    }

    /// Returns the XOR distance between two keys.
    pub fn distance(&self, other: &Key) -> Key {
        let mut bytes = [0u8; Self::BYTES];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Key(bytes)
    }

    /// Returns the number of leading bits both keys share.
    pub fn common_prefix_len(&self, other: &Key) -> usize {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| a ^ b)
            .enumerate()
            .find(|(_, byte)| *byte != 0)
            .map(|(i, byte)| i * 8 + byte.leading_zeros() as usize)
            .unwrap_or(Self::BITS)
    }

    /// Generates a random key sharing exactly `cpl` leading bits with this key.
    ///
    /// The first `cpl` bits are copied, bit `cpl` is flipped and all following
    /// bits are random. Returns `None` if `cpl` is not below [`Key::BITS`].
    pub fn random_with_cpl(&self, cpl: usize) -> Option<Key> {
        if cpl >= Self::BITS {
            return None;
        }

        let mut bytes = [0u8; Self::BYTES];
        rand::thread_rng().fill(&mut bytes);

        let full = cpl / 8;
        let partial = cpl % 8;
        bytes[..full].copy_from_slice(&self.0[..full]);

        let keep = if partial == 0 {
            0
        } else {
            0xffu8 << (8 - partial)
        };
        let flip = 0x80u8 >> partial;
        let own = self.0[full];
        bytes[full] = (own & keep) | (!own & flip) | (bytes[full] & !(keep | flip));

        Some(Key(bytes))
    }
}

impl From<NodeId> for Key {
    fn from(id: NodeId) -> Self {
        Key(*id.as_bytes())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({self})")
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// A peer with a position in the keyspace.
pub trait KadPeer: PeerInfo {
    /// Returns the position of the peer in the keyspace.
    fn kad_key(&self) -> Key;
}
