//! The crawler facade running crawls and monitoring runs on the engine.

use crate::driver::{CrawlDriver, DialDriver, PeerSource};
use crate::summary::{CrawlState, CrawlSummary};
use crate::transport::Dialer;
use crate::worker::CrawlConfig;
use log::info;
use overlay_crawler_engine::{
    AddrType, CrawlHandler, CrawlHandlerConfig, DialHandler, Engine, EngineConfig, EngineError,
    NeighborsRecord, PeerInfo, StoreError, VisitStore,
};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Errors that can occur during a crawl or monitoring run.
#[derive(Debug)]
pub enum CrawlerError {
    /// The engine could not be set up.
    Engine(EngineError),
    /// Neighbor records could not be persisted after the crawl.
    PersistNeighbors(StoreError),
}

impl fmt::Display for CrawlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrawlerError::Engine(err) => write!(f, "Engine error: {err}"),
            CrawlerError::PersistNeighbors(err) => {
                write!(f, "Failed to persist neighbor information: {err}")
            }
        }
    }
}

impl std::error::Error for CrawlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CrawlerError::Engine(err) => Some(err),
            CrawlerError::PersistNeighbors(err) => Some(err),
        }
    }
}

impl From<EngineError> for CrawlerError {
    fn from(err: EngineError) -> Self {
        CrawlerError::Engine(err)
    }
}

impl From<StoreError> for CrawlerError {
    fn from(err: StoreError) -> Self {
        CrawlerError::PersistNeighbors(err)
    }
}

/// A crawler for Kademlia-style overlay networks.
///
/// Created through [`CrawlerBuilder`](crate::CrawlerBuilder). A crawler can
/// run any number of crawls and monitoring runs, each one with its own
/// engine.
pub struct Crawler<D: Dialer> {
    dialer: Arc<D>,
    engine: EngineConfig,
    crawl: CrawlConfig,
    addr_track_type: AddrType,
    track_neighbors: bool,
    crawl_id: Option<i64>,
}

impl<D: Dialer> Crawler<D> {
    pub(crate) fn new(
        dialer: Arc<D>,
        engine: EngineConfig,
        crawl: CrawlConfig,
        addr_track_type: AddrType,
        track_neighbors: bool,
        crawl_id: Option<i64>,
    ) -> Self {
        Crawler {
            dialer,
            engine,
            crawl,
            addr_track_type,
            track_neighbors,
            crawl_id,
        }
    }

    /// Crawl the network starting from the bootstrap peers.
    ///
    /// Every reachable peer is visited once. Visits are written to `store`
    /// while the crawl runs, neighbor records after it ended, also when it
    /// was cancelled.
    ///
    /// # Arguments
    ///
    /// * `bootstrap` - The peers to start crawling from.
    /// * `store` - Receives visits and neighbor records.
    /// * `cancel` - Stops the crawl, peers in flight are dropped.
    ///
    /// # Returns
    ///
    /// * `Ok(CrawlSummary)` - Statistics of the crawl, cancelled or not.
    /// * `Err(CrawlerError)` - If the crawl could not start or neighbors could
    ///   not be persisted.
    pub async fn crawl<S: VisitStore>(
        &self,
        bootstrap: Vec<D::Peer>,
        store: Arc<S>,
        cancel: CancellationToken,
    ) -> Result<CrawlSummary, CrawlerError> {
        let started = Instant::now();

        let driver = CrawlDriver::new(
            self.dialer.clone(),
            store.clone(),
            self.crawl.clone(),
            self.crawl_id,
            self.addr_track_type,
            bootstrap,
        );
        let handler = CrawlHandler::<D::Peer>::new(CrawlHandlerConfig {
            track_neighbors: self.track_neighbors,
        });
        let mut engine = Engine::new(self.engine.clone(), driver, handler)?;

        let (state, remaining) = match engine.run(cancel).await {
            Ok(remaining) => (CrawlState::Succeeded, remaining.len()),
            Err(cancelled) => (CrawlState::Cancelled, cancelled.remaining.len()),
        };
        let handler = engine.into_handler();

        persist_neighbors(&handler, store.as_ref(), self.crawl_id).await?;

        let summary = CrawlSummary::from_handler(&handler, state, remaining, started.elapsed());
        summary.log();
        Ok(summary)
    }

    /// Keep dialing the peers `source` returns until `cancel` fires.
    ///
    /// Peers are dialed again every time the source returns them.
    ///
    /// # Arguments
    ///
    /// * `source` - Polled for peers every `poll_interval`.
    /// * `store` - Receives a visit per dial.
    /// * `poll_interval` - Time between two polls of `source`.
    /// * `cancel` - Stops monitoring.
    ///
    /// # Returns
    ///
    /// * `Ok(DialHandler)` - Dial counts of the run.
    /// * `Err(CrawlerError)` - If monitoring could not start.
    pub async fn monitor<S, P>(
        &self,
        source: P,
        store: Arc<S>,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Result<DialHandler, CrawlerError>
    where
        S: VisitStore,
        P: PeerSource<Peer = D::Peer>,
    {
        let driver = DialDriver::new(
            self.dialer.clone(),
            store,
            source,
            poll_interval,
            self.crawl.dial_timeout,
            self.crawl.addr_dial_type,
        );
        let config = EngineConfig {
            duplicate_processing: true,
            ..self.engine.clone()
        };
        let mut engine = Engine::new(config, driver, DialHandler::new())?;

        let remaining = match engine.run(cancel).await {
            Ok(remaining) => remaining.len(),
            Err(cancelled) => cancelled.remaining.len(),
        };

        let handler = *engine.handler();
        info!(
            "Stopped monitoring: {} dialed, {} undialable, {} queued",
            handler.dialed_peers, handler.undialable_peers, remaining
        );
        Ok(handler)
    }
}

/// Stores one neighbor record per tracked routing table.
///
/// Peers and neighbors that were written during the crawl are referenced by
/// their storage ID, all others by their external ID.
async fn persist_neighbors<I: PeerInfo, S: VisitStore>(
    handler: &CrawlHandler<I>,
    store: &S,
    crawl_id: Option<i64>,
) -> Result<(), StoreError> {
    if handler.routing_tables.is_empty() {
        return Ok(());
    }

    info!(
        "Storing neighbor information of {} peers",
        handler.routing_tables.len()
    );
    let started = Instant::now();
    let mut neighbors = 0;

    for (i, (peer_id, table)) in handler.routing_tables.iter().enumerate() {
        if i > 0 && i % 100 == 0 {
            info!("Stored {i} peers and their neighbors");
        }
        neighbors += table.neighbors.len();

        let peer_id = peer_id.to_string();
        let mut record = NeighborsRecord {
            crawl_id,
            peer_storage_id: handler.peer_mappings.get(&peer_id).copied(),
            peer_id,
            neighbor_storage_ids: Vec::new(),
            neighbor_peer_ids: Vec::new(),
            error_bits: table.error_bits,
        };
        for neighbor in &table.neighbors {
            let id = neighbor.id().to_string();
            match handler.peer_mappings.get(&id) {
                Some(storage_id) => record.neighbor_storage_ids.push(*storage_id),
                None => record.neighbor_peer_ids.push(id),
            }
        }
        store.persist_neighbors(record).await?;
    }

    info!(
        "Stored neighbor information of {} peers ({neighbors} neighbors) in {:?}",
        handler.routing_tables.len(),
        started.elapsed()
    );
    Ok(())
}
