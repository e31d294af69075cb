//! Transport stand-ins shared by unit tests.

use crate::kademlia::Key;
use crate::node::NodeRecord;
use crate::transport::{Dialer, FetchError, FindNode, Identity, Session};
use overlay_crawler_engine::BoxError;
use std::net::SocketAddr;

/// A session to a peer without neighbors.
pub(crate) struct EmptySession;

impl FindNode<NodeRecord> for EmptySession {
    async fn find_node(&self, _target: Key) -> Result<Vec<NodeRecord>, FetchError> {
        Ok(Vec::new())
    }

    async fn reconnect(&self) -> Result<(), FetchError> {
        Ok(())
    }
}

impl Session<NodeRecord> for EmptySession {
    async fn identify(&self) -> Result<Identity, BoxError> {
        Ok(Identity::default())
    }

    async fn close(&self) {}
}

/// Connects to every peer, or to none if `refuse` is set.
pub(crate) struct StaticDialer {
    pub refuse: bool,
}

impl Dialer for StaticDialer {
    type Peer = NodeRecord;
    type Session = EmptySession;

    async fn dial(&self, _peer: &NodeRecord, _addrs: &[SocketAddr]) -> Result<EmptySession, BoxError> {
        if self.refuse {
            return Err("connection refused".into());
        }
        Ok(EmptySession)
    }
}
