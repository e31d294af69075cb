//! Capabilities the engine requires from the peer information it schedules.

use std::fmt;
use std::hash::Hash;
use std::net::SocketAddr;

/// Types that carry a stable scheduling key.
///
/// The engine uses the key to deduplicate work: a key that is in flight or was
/// already processed is never handed to a second worker.
pub trait Keyed {
    /// Returns the deduplication key.
    fn key(&self) -> String;
}

/// Information about a single node of an overlay network.
///
/// The key returned through [`Keyed`] does not have to be the textual form of
/// [`PeerInfo::id`]. Discovery protocols with signed node records may want to
/// visit the same node again when a newer record with different addresses
/// shows up, in which case the key should include the record sequence number.
pub trait PeerInfo: Keyed + Clone + fmt::Debug + Send + Sync + 'static {
    /// Stable identifier of the node, derived from its public key or record.
    type Id: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static;

    /// Returns the node identifier.
    fn id(&self) -> &Self::Id;

    /// Returns all transport addresses the node was observed at.
    fn addrs(&self) -> &[SocketAddr];

    /// Combines two observations of the same node.
    ///
    /// # Panics
    ///
    /// Implementations panic if the identifiers of both observations differ.
    fn merge(self, other: Self) -> Self;
}
