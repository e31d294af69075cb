//! Handlers deciding what finished work means for the rest of a run.

use crate::error::NetError;
use crate::peer::PeerInfo;
use crate::pool::Outcome;
use crate::result::{CrawlResult, DialResult, RoutingTable, WorkResult, WriteResult};
use log::{debug, warn};
use std::collections::HashMap;

/// Receives every result of an engine run.
///
/// Both methods are called from the engine loop, one at a time, so
/// implementations need no synchronization of their own.
pub trait Handler<R: WorkResult> {
    /// Handles the result of a peer worker.
    ///
    /// # Returns
    ///
    /// Peers that should be processed as a consequence of this result. The
    /// engine drops those that are in flight or were already processed.
    fn handle_peer_result(&mut self, outcome: &Outcome<R>) -> Vec<R::Peer>;

    /// Handles the result of a writer.
    fn handle_write_result(&mut self, outcome: &Outcome<WriteResult>);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CrawlHandlerConfig {
    /// Keep the routing tables of all crawled peers in memory so that they
    /// can be persisted after the crawl.
    pub track_neighbors: bool,
}

/// Aggregates the results of a crawl.
#[derive(Debug)]
pub struct CrawlHandler<I: PeerInfo> {
    config: CrawlHandlerConfig,
    /// External peer IDs mapped to their storage IDs.
    pub peer_mappings: HashMap<String, i64>,
    /// Routing tables of crawled peers, only filled if neighbors are tracked.
    pub routing_tables: HashMap<I::Id, RoutingTable<I>>,
    pub agent_versions: HashMap<String, usize>,
    pub protocols: HashMap<String, usize>,
    /// Connect errors by kind.
    pub connect_errors: HashMap<NetError, usize>,
    /// Crawl errors by kind.
    pub crawl_errors: HashMap<NetError, usize>,
    pub crawled_peers: usize,
}

impl<I: PeerInfo> CrawlHandler<I> {
    pub fn new(config: CrawlHandlerConfig) -> Self {
        CrawlHandler {
            config,
            peer_mappings: HashMap::new(),
            routing_tables: HashMap::new(),
            agent_versions: HashMap::new(),
            protocols: HashMap::new(),
            connect_errors: HashMap::new(),
            crawl_errors: HashMap::new(),
            crawled_peers: 0,
        }
    }

    /// Returns the number of crawl errors of all kinds.
    pub fn total_errors(&self) -> usize {
        self.crawl_errors.values().sum()
    }

    /// Returns the number of peers that could not be connected to.
    pub fn total_connect_errors(&self) -> usize {
        self.connect_errors.values().sum()
    }
}

impl<I: PeerInfo> Handler<CrawlResult<I>> for CrawlHandler<I> {
    fn handle_peer_result(&mut self, outcome: &Outcome<CrawlResult<I>>) -> Vec<I> {
        self.crawled_peers += 1;

        let result = match &outcome.result {
            Ok(result) => result,
            Err(err) => {
                warn!("Crawl worker {} failed on {}: {err}", outcome.worker, outcome.key);
                return Vec::new();
            }
        };

        debug!(
            "Crawled {} in {:?}, dialable: {}, neighbors: {}, failed buckets: {}, connect error: {:?}, crawl error: {:?}",
            result.info.id(),
            result.crawl_duration(),
            result.is_success(),
            result.routing_table.as_ref().map_or(0, |rt| rt.neighbors.len()),
            result.routing_table.as_ref().map_or(0, |rt| rt.failed_buckets()),
            result.connect_error_display(),
            result.crawl_error_display(),
        );

        *self
            .agent_versions
            .entry(result.agent.clone().unwrap_or_default())
            .or_default() += 1;
        for protocol in &result.protocols {
            *self.protocols.entry(protocol.clone()).or_default() += 1;
        }

        if result.connect_error.is_none() {
            // An empty or all-error table carries no topology information.
            if let Some(table) = &result.routing_table {
                if self.config.track_neighbors && !table.all_failed() {
                    self.routing_tables
                        .insert(result.info.id().clone(), table.clone());
                }
            }
        } else {
            let kind = result.connect_error_kind.unwrap_or(NetError::Unknown);
            *self.connect_errors.entry(kind).or_default() += 1;
        }

        if result.crawl_error.is_some() {
            let kind = result.crawl_error_kind.unwrap_or(NetError::Unknown);
            *self.crawl_errors.entry(kind).or_default() += 1;
        }

        match &result.routing_table {
            Some(table) if !result.routing_table_from_api => table.neighbors.clone(),
            _ => Vec::new(),
        }
    }

    fn handle_write_result(&mut self, outcome: &Outcome<WriteResult>) {
        let Ok(write) = &outcome.result else {
            return;
        };

        if let Some(storage_id) = write.storage_id {
            self.peer_mappings.insert(write.peer_id.clone(), storage_id);
        }
    }
}

/// Handler for dial runs, dialing never leads to more work.
#[derive(Debug, Clone, Copy, Default)]
pub struct DialHandler {
    pub dialed_peers: usize,
    pub undialable_peers: usize,
}

impl DialHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<I: PeerInfo> Handler<DialResult<I>> for DialHandler {
    fn handle_peer_result(&mut self, outcome: &Outcome<DialResult<I>>) -> Vec<I> {
        self.dialed_peers += 1;
        match &outcome.result {
            Ok(result) if result.is_success() => {}
            _ => self.undialable_peers += 1,
        }
        Vec::new()
    }

    fn handle_write_result(&mut self, _outcome: &Outcome<WriteResult>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SharedError;
    use crate::peer::Keyed;
    use std::io;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct TestPeer(&'static str);

    impl Keyed for TestPeer {
        fn key(&self) -> String {
            self.0.to_string()
        }
    }

    impl PeerInfo for TestPeer {
        type Id = &'static str;

        fn id(&self) -> &&'static str {
            &self.0
        }

        fn addrs(&self) -> &[SocketAddr] {
            &[]
        }

        fn merge(self, _other: Self) -> Self {
            self
        }
    }

    fn crawled(peer: &'static str, neighbors: &[&'static str]) -> CrawlResult<TestPeer> {
        let mut result = CrawlResult::new("crawler-00", TestPeer(peer));
        let mut table = RoutingTable::new(peer);
        table.neighbors = neighbors.iter().map(|n| TestPeer(*n)).collect();
        result.routing_table = Some(table);
        result.agent = Some("kubo/0.30.0".to_string());
        result.protocols = vec!["/ipfs/kad/1.0.0".to_string(), "/ipfs/id/1.0.0".to_string()];
        result
    }

    fn outcome<R>(key: &str, result: R) -> Outcome<R> {
        Outcome {
            worker: 0,
            key: key.to_string(),
            result: Ok(result),
        }
    }

    fn refused() -> SharedError {
        Arc::new(io::Error::from(io::ErrorKind::ConnectionRefused))
    }

    #[test]
    fn test_returns_neighbors_and_tracks_table() {
        let mut handler = CrawlHandler::<TestPeer>::new(CrawlHandlerConfig {
            track_neighbors: true,
        });

        let next = handler.handle_peer_result(&outcome("a", crawled("a", &["b", "c"])));
        assert_eq!(next, vec![TestPeer("b"), TestPeer("c")]);
        assert_eq!(handler.crawled_peers, 1);
        assert_eq!(handler.agent_versions.get("kubo/0.30.0"), Some(&1));
        assert_eq!(handler.protocols.get("/ipfs/kad/1.0.0"), Some(&1));
        assert!(handler.routing_tables.contains_key("a"));
        assert_eq!(handler.total_errors(), 0);
        assert_eq!(handler.total_connect_errors(), 0);
    }

    #[test]
    fn test_api_routing_table_is_not_crawled() {
        let mut handler = CrawlHandler::<TestPeer>::new(CrawlHandlerConfig::default());

        let mut result = crawled("a", &["b", "c"]);
        result.routing_table_from_api = true;
        assert!(handler.handle_peer_result(&outcome("a", result)).is_empty());

        let mut result = crawled("d", &[]);
        result.routing_table = None;
        assert!(handler.handle_peer_result(&outcome("d", result)).is_empty());
        assert_eq!(handler.crawled_peers, 2);
    }

    #[test]
    fn test_all_failed_table_is_not_tracked() {
        let mut handler = CrawlHandler::<TestPeer>::new(CrawlHandlerConfig {
            track_neighbors: true,
        });

        let mut result = crawled("a", &[]);
        if let Some(table) = result.routing_table.as_mut() {
            table.error_bits = u16::MAX;
        }
        result.set_crawl_error(Arc::new(io::Error::new(io::ErrorKind::Other, "stream reset")));
        handler.handle_peer_result(&outcome("a", result));

        assert!(handler.routing_tables.is_empty());
        assert_eq!(handler.crawl_errors.get(&NetError::StreamReset), Some(&1));
        assert_eq!(handler.total_errors(), 1);

        // Only the walked buckets count.
        let mut result = crawled("b", &[]);
        if let Some(table) = result.routing_table.as_mut() {
            table.buckets = 4;
            table.error_bits = 0b1111;
        }
        handler.handle_peer_result(&outcome("b", result));
        assert!(handler.routing_tables.is_empty());

        let mut result = crawled("c", &["d"]);
        if let Some(table) = result.routing_table.as_mut() {
            table.buckets = 4;
            table.error_bits = 0b0111;
        }
        handler.handle_peer_result(&outcome("c", result));
        assert!(handler.routing_tables.contains_key("c"));
    }

    #[test]
    fn test_connect_errors_are_counted() {
        let mut handler = CrawlHandler::<TestPeer>::new(CrawlHandlerConfig {
            track_neighbors: true,
        });

        let mut result = crawled("a", &[]);
        result.set_connect_error(refused());
        handler.handle_peer_result(&outcome("a", result));

        assert!(handler.routing_tables.is_empty());
        assert_eq!(
            handler.connect_errors.get(&NetError::ConnectionRefused),
            Some(&1)
        );
        assert_eq!(handler.total_connect_errors(), 1);
        assert_eq!(handler.total_errors(), 0);
    }

    #[test]
    fn test_failed_worker_yields_nothing() {
        let mut handler = CrawlHandler::<TestPeer>::new(CrawlHandlerConfig::default());
        let failed = Outcome {
            worker: 3,
            key: "a".to_string(),
            result: Err("worker exploded".into()),
        };

        assert!(handler.handle_peer_result(&failed).is_empty());
        assert_eq!(handler.crawled_peers, 1);
    }

    #[test]
    fn test_write_results_map_storage_ids() {
        let mut handler = CrawlHandler::<TestPeer>::new(CrawlHandlerConfig::default());
        let write = WriteResult {
            writer_id: "writer-00".to_string(),
            peer_id: "a".to_string(),
            storage_id: Some(42),
            duration: Duration::from_millis(3),
            error: None,
        };
        handler.handle_write_result(&outcome("a", write));

        let unwritten = WriteResult {
            writer_id: "writer-00".to_string(),
            peer_id: "b".to_string(),
            storage_id: None,
            duration: Duration::ZERO,
            error: None,
        };
        handler.handle_write_result(&outcome("b", unwritten));

        assert_eq!(handler.peer_mappings.get("a"), Some(&42));
        assert_eq!(handler.peer_mappings.get("b"), None);
    }

    #[test]
    fn test_dial_handler_counts() {
        let mut handler = DialHandler::new();

        let ok = DialResult::new("dialer-00", TestPeer("a"));
        let mut failed = DialResult::new("dialer-01", TestPeer("b"));
        failed.set_error(refused());

        assert!(handler.handle_peer_result(&outcome("a", ok)).is_empty());
        assert!(handler.handle_peer_result(&outcome("b", failed)).is_empty());
        assert_eq!(handler.dialed_peers, 2);
        assert_eq!(handler.undialable_peers, 1);
    }
}
