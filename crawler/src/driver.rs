//! Drivers binding the engine to a [`Dialer`].
//!
//! [`CrawlDriver`] walks the network starting at a fixed set of bootstrap
//! peers. [`DialDriver`] keeps dialing peers it periodically obtains from a
//! [`PeerSource`] until it is closed.

use crate::transport::Dialer;
use crate::worker::{CrawlConfig, CrawlWorker, DialWorker};
use log::{debug, info, warn};
use overlay_crawler_engine::{
    AddrType, BoxError, CrawlResult, CrawlWriter, DialResult, DialWriter, Driver, VisitStore,
};
use std::future::Future;
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Drives a crawl from a set of bootstrap peers.
pub struct CrawlDriver<D: Dialer, S> {
    dialer: Arc<D>,
    store: Arc<S>,
    config: CrawlConfig,
    crawl_id: Option<i64>,
    addr_track_type: AddrType,
    bootstrap: Vec<D::Peer>,
    workers: usize,
    writers: usize,
    closed: bool,
}

impl<D: Dialer, S: VisitStore> CrawlDriver<D, S> {
    /// Create a new crawl driver.
    ///
    /// # Arguments
    ///
    /// * `dialer` - Shared by all crawl workers.
    /// * `store` - Shared by all writers.
    /// * `config` - Handed to every crawl worker.
    /// * `crawl_id` - Stored with every visit.
    /// * `addr_track_type` - Addresses of this type are stored with visits.
    /// * `bootstrap` - The peers the crawl starts at.
    pub fn new(
        dialer: Arc<D>,
        store: Arc<S>,
        config: CrawlConfig,
        crawl_id: Option<i64>,
        addr_track_type: AddrType,
        bootstrap: Vec<D::Peer>,
    ) -> Self {
        CrawlDriver {
            dialer,
            store,
            config,
            crawl_id,
            addr_track_type,
            bootstrap,
            workers: 0,
            writers: 0,
            closed: false,
        }
    }
}

impl<D: Dialer, S: VisitStore> Driver for CrawlDriver<D, S> {
    type Peer = D::Peer;
    type Output = CrawlResult<D::Peer>;
    type Worker = CrawlWorker<D>;
    type Writer = CrawlWriter<D::Peer, S>;

    fn new_worker(&mut self) -> Result<CrawlWorker<D>, BoxError> {
        let id = format!("crawler-{:02}", self.workers);
        self.workers += 1;
        Ok(CrawlWorker::new(id, self.dialer.clone(), self.config.clone()))
    }

    fn new_writer(&mut self) -> Result<CrawlWriter<D::Peer, S>, BoxError> {
        let id = format!("writer-{:02}", self.writers);
        self.writers += 1;
        Ok(CrawlWriter::new(
            id,
            self.store.clone(),
            self.crawl_id,
            self.addr_track_type,
        ))
    }

    /// Hands out the bootstrap peers, the channel is closed right away.
    fn tasks(&mut self) -> mpsc::Receiver<D::Peer> {
        let bootstrap = mem::take(&mut self.bootstrap);
        let (tx, rx) = mpsc::channel(bootstrap.len().max(1));
        info!("Starting crawl with {} bootstrap peers", bootstrap.len());

        for peer in bootstrap {
            // Capacity covers every peer.
            if let Err(err) = tx.try_send(peer) {
                warn!("Dropping bootstrap peer: {err}");
            }
        }
        rx
    }

    fn close(&mut self) {
        if mem::replace(&mut self.closed, true) {
            return;
        }
        debug!(
            "Closed crawl driver after creating {} workers and {} writers",
            self.workers, self.writers
        );
    }
}

/// Supplies the peers a [`DialDriver`] dials.
pub trait PeerSource: Send + 'static {
    type Peer: Send + 'static;

    /// Returns the peers to dial next.
    fn fetch(&mut self) -> impl Future<Output = Result<Vec<Self::Peer>, BoxError>> + Send;
}

/// Drives a monitoring run, dialing whatever a [`PeerSource`] returns.
///
/// The source is polled every `poll_interval` by a background task which
/// lives until [`Driver::close`] is called.
pub struct DialDriver<D: Dialer, S, P> {
    dialer: Arc<D>,
    store: Arc<S>,
    source: Option<P>,
    poll_interval: Duration,
    dial_timeout: Duration,
    addr_dial_type: AddrType,
    shutdown: CancellationToken,
    workers: usize,
    writers: usize,
}

impl<D, S, P> DialDriver<D, S, P>
where
    D: Dialer,
    S: VisitStore,
    P: PeerSource<Peer = D::Peer>,
{
    pub fn new(
        dialer: Arc<D>,
        store: Arc<S>,
        source: P,
        poll_interval: Duration,
        dial_timeout: Duration,
        addr_dial_type: AddrType,
    ) -> Self {
        DialDriver {
            dialer,
            store,
            source: Some(source),
            poll_interval,
            dial_timeout,
            addr_dial_type,
            shutdown: CancellationToken::new(),
            workers: 0,
            writers: 0,
        }
    }
}

impl<D, S, P> Driver for DialDriver<D, S, P>
where
    D: Dialer,
    S: VisitStore,
    P: PeerSource<Peer = D::Peer>,
{
    type Peer = D::Peer;
    type Output = DialResult<D::Peer>;
    type Worker = DialWorker<D>;
    type Writer = DialWriter<D::Peer, S>;

    fn new_worker(&mut self) -> Result<DialWorker<D>, BoxError> {
        let id = format!("dialer-{:02}", self.workers);
        self.workers += 1;
        Ok(DialWorker::new(
            id,
            self.dialer.clone(),
            self.dial_timeout,
            self.addr_dial_type,
        ))
    }

    fn new_writer(&mut self) -> Result<DialWriter<D::Peer, S>, BoxError> {
        let id = format!("writer-{:02}", self.writers);
        self.writers += 1;
        Ok(DialWriter::new(id, self.store.clone()))
    }

    /// Spawns the polling task, must be called from within a tokio runtime.
    fn tasks(&mut self) -> mpsc::Receiver<D::Peer> {
        let (tx, rx) = mpsc::channel(1);
        let Some(source) = self.source.take() else {
            warn!("Peer source already handed out");
            return rx;
        };

        tokio::spawn(poll_source(
            source,
            tx,
            self.poll_interval,
            self.shutdown.clone(),
        ));
        rx
    }

    fn close(&mut self) {
        self.shutdown.cancel();
    }
}

async fn poll_source<P: PeerSource>(
    mut source: P,
    tx: mpsc::Sender<P::Peer>,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    'poll: loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let fetched = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            fetched = source.fetch() => fetched,
        };

        let peers = match fetched {
            Ok(peers) => peers,
            Err(err) => {
                warn!("Failed to fetch peers to dial: {err}");
                continue;
            }
        };

        debug!("Fetched {} peers to dial", peers.len());
        for peer in peers {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break 'poll,
                sent = tx.send(peer) => {
                    if sent.is_err() {
                        break 'poll;
                    }
                }
            }
        }
    }
    debug!("Stopped polling for peers to dial");
}
