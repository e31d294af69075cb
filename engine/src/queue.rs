//! Pending peer tasks of an engine run.

use crate::addr::AddrType;
use crate::peer::PeerInfo;
use std::collections::HashMap;

/// Pending peers keyed by their deduplication key.
///
/// Peers with at least one address matching the dial filter are handed out
/// before peers that have none. Such peers are kept around because a later
/// observation may still reveal a usable address. Which peer of a tier is
/// handed out next is unspecified.
#[derive(Debug)]
pub struct PeerQueue<I> {
    addr_type: AddrType,
    dialable: HashMap<String, I>,
    waiting: HashMap<String, I>,
}

impl<I: PeerInfo> PeerQueue<I> {
    /// Create an empty queue ranking peers by the given dial filter.
    pub fn new(addr_type: AddrType) -> Self {
        PeerQueue {
            addr_type,
            dialable: HashMap::new(),
            waiting: HashMap::new(),
        }
    }

    /// Adds a peer to the queue.
    ///
    /// If a peer with the same key is already pending both observations are
    /// merged into a single entry, which may move it into the dialable tier.
    ///
    /// # Returns
    ///
    /// `true` if the peer was not pending before.
    pub fn push(&mut self, peer: I) -> bool {
        let key = peer.key();
        let (peer, fresh) = match self.remove(&key) {
            Some(queued) => (peer.merge(queued), false),
            None => (peer, true),
        };

        if peer.addrs().iter().any(|addr| self.addr_type.matches(addr)) {
            self.dialable.insert(key, peer);
        } else {
            self.waiting.insert(key, peer);
        }
        fresh
    }

    /// Returns the key of the peer that should be handed out next.
    pub fn next_key(&self) -> Option<&String> {
        self.dialable
            .keys()
            .next()
            .or_else(|| self.waiting.keys().next())
    }

    /// Removes and returns the pending peer with the given key.
    pub fn remove(&mut self, key: &str) -> Option<I> {
        self.dialable
            .remove(key)
            .or_else(|| self.waiting.remove(key))
    }

    pub fn len(&self) -> usize {
        self.dialable.len() + self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dialable.is_empty() && self.waiting.is_empty()
    }

    /// Consumes the queue, returning all pending peers.
    pub fn into_map(self) -> HashMap<String, I> {
        let mut peers = self.dialable;
        peers.extend(self.waiting);
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::Keyed;
    use std::net::SocketAddr;

    #[derive(Debug, Clone, PartialEq)]
    struct TestPeer {
        id: String,
        addrs: Vec<SocketAddr>,
    }

    impl TestPeer {
        fn new(id: &str, addrs: &[&str]) -> Self {
            TestPeer {
                id: id.to_string(),
                addrs: addrs.iter().map(|a| a.parse().unwrap()).collect(),
            }
        }
    }

    impl Keyed for TestPeer {
        fn key(&self) -> String {
            self.id.clone()
        }
    }

    impl PeerInfo for TestPeer {
        type Id = String;

        fn id(&self) -> &String {
            &self.id
        }

        fn addrs(&self) -> &[SocketAddr] {
            &self.addrs
        }

        fn merge(mut self, other: Self) -> Self {
            assert_eq!(self.id, other.id);
            for addr in other.addrs {
                if !self.addrs.contains(&addr) {
                    self.addrs.push(addr);
                }
            }
            self
        }
    }

    #[test]
    fn test_dialable_peers_come_first() {
        let mut queue = PeerQueue::new(AddrType::Public);
        assert!(queue.push(TestPeer::new("a", &[])));
        assert!(queue.push(TestPeer::new("b", &["10.0.0.1:4001"])));
        assert!(queue.push(TestPeer::new("c", &["8.8.8.8:4001"])));
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.next_key().map(String::as_str), Some("c"));
        queue.remove("c");

        // The remaining peers are both undialable, any of them may be next.
        let next = queue.next_key().cloned().unwrap();
        assert!(next == "a" || next == "b");
        queue.remove(&next);
        queue.remove(if next == "a" { "b" } else { "a" });

        assert!(queue.is_empty());
        assert_eq!(queue.next_key(), None);
    }

    #[test]
    fn test_push_merges_pending_peer() {
        let mut queue = PeerQueue::new(AddrType::Any);
        assert!(queue.push(TestPeer::new("d", &[])));
        assert!(!queue.push(TestPeer::new("d", &["1.2.3.4:30303"])));

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_key().map(String::as_str), Some("d"));

        let peer = queue.remove("d").unwrap();
        assert_eq!(peer.addrs, vec!["1.2.3.4:30303".parse().unwrap()]);
    }

    #[test]
    fn test_into_map_returns_both_tiers() {
        let mut queue = PeerQueue::new(AddrType::Any);
        queue.push(TestPeer::new("a", &[]));
        queue.push(TestPeer::new("b", &["1.2.3.4:1"]));

        let peers = queue.into_map();
        assert_eq!(peers.len(), 2);
        assert!(peers.contains_key("a"));
        assert!(peers.contains_key("b"));
    }
}
