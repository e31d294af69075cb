//! Boundary to the wire protocol of a network.
//!
//! A [`Dialer`] opens [`Session`]s to peers. Sessions answer closest-peer
//! queries through [`FindNode`] and report what the remote peer says about
//! itself. Dialers are shared by all workers, sessions by all bucket queries
//! of a single crawl.

use crate::kademlia::{KadPeer, Key};
use overlay_crawler_engine::BoxError;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;

/// Errors of a single closest-peer query.
#[derive(Debug)]
pub enum FetchError {
    /// The remote peer is out of resources and asked us to back off.
    Overloaded,
    /// The connection broke after the query stream was opened.
    ConnectionLost,
    /// The query failed for any other reason.
    Failed(BoxError),
    /// The crawl was cancelled while querying.
    Cancelled,
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Overloaded => write!(f, "resource limit exceeded"),
            FetchError::ConnectionLost => write!(f, "connection failed"),
            FetchError::Failed(err) => write!(f, "{err}"),
            FetchError::Cancelled => write!(f, "query cancelled"),
        }
    }
}

impl Error for FetchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            FetchError::Failed(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// What a peer reports about itself once connected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub agent: Option<String>,
    pub protocols: Vec<String>,
    pub listen_addrs: Vec<SocketAddr>,
}

/// Closest-peer queries against a connected peer.
pub trait FindNode<I>: Send + Sync + 'static {
    /// Asks the peer for the peers it knows closest to `target`.
    fn find_node(&self, target: Key) -> impl Future<Output = Result<Vec<I>, FetchError>> + Send;

    /// Re-establishes the connection after [`FetchError::ConnectionLost`].
    fn reconnect(&self) -> impl Future<Output = Result<(), FetchError>> + Send;
}

/// An open connection to a peer.
pub trait Session<I>: FindNode<I> {
    /// Returns what the peer reports about itself.
    fn identify(&self) -> impl Future<Output = Result<Identity, BoxError>> + Send;

    /// Closes the connection.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Opens sessions to peers of one network.
pub trait Dialer: Send + Sync + 'static {
    type Peer: KadPeer;
    type Session: Session<Self::Peer>;

    /// Connects to `peer` over one of `addrs`.
    ///
    /// `addrs` is the subset of the peer's addresses that passed filtering
    /// and is never empty.
    fn dial(
        &self,
        peer: &Self::Peer,
        addrs: &[SocketAddr],
    ) -> impl Future<Output = Result<Self::Session, BoxError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use overlay_crawler_engine::NetError;

    #[test]
    fn test_fetch_errors_classify() {
        assert_eq!(
            NetError::classify(&FetchError::Overloaded),
            NetError::ResourceLimitExceeded
        );
        assert_eq!(
            NetError::classify(&FetchError::Failed("stream reset".into())),
            NetError::StreamReset
        );
        assert_eq!(NetError::classify(&FetchError::Cancelled), NetError::Unknown);
    }
}
