//! Peer workers: crawl a peer's routing table or just check it is reachable.

use crate::backoff::{retry, ExponentialBackoff};
use crate::kademlia::KadPeer;
use crate::neighbors::{drain_buckets, WalkConfig};
use crate::transport::{Dialer, Session};
use log::debug;
use overlay_crawler_engine::{
    AddrType, BoxError, CrawlResult, DialResult, NetError, NoPublicAddrs, PeerInfo, Worker,
};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Settings of a single crawl worker.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// Upper bound of a single connection attempt.
    pub dial_timeout: Duration,
    /// Upper bound of the identify exchange after the walk.
    pub identify_timeout: Duration,
    /// Addresses of this type are dialed, all others are skipped.
    pub addr_dial_type: AddrType,
    pub walk: WalkConfig,
    /// Retry schedule for transient connect failures.
    pub backoff: ExponentialBackoff,
    /// Log raw errors instead of their kind.
    pub log_errors: bool,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        CrawlConfig {
            dial_timeout: Duration::from_secs(60),
            identify_timeout: Duration::from_secs(5),
            addr_dial_type: AddrType::Public,
            walk: WalkConfig::default(),
            backoff: ExponentialBackoff::default(),
            log_errors: false,
        }
    }
}

/// Connects to peers and walks their routing tables.
pub struct CrawlWorker<D: Dialer> {
    id: String,
    dialer: Arc<D>,
    config: CrawlConfig,
}

impl<D: Dialer> CrawlWorker<D> {
    /// Create a new crawl worker.
    ///
    /// # Arguments
    ///
    /// * `id` - Name of the worker, stored with every result it produces.
    /// * `dialer` - Opens sessions, shared with the other workers.
    /// * `config` - Timeouts, filters and walk settings.
    pub fn new(id: impl Into<String>, dialer: Arc<D>, config: CrawlConfig) -> Self {
        CrawlWorker {
            id: id.into(),
            dialer,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    async fn crawl(&self, cancel: &CancellationToken, peer: D::Peer) -> CrawlResult<D::Peer> {
        let mut result = CrawlResult::new(self.id.clone(), peer);
        result.log_errors = self.config.log_errors;

        let addrs = self.config.addr_dial_type.filter(result.info.addrs());
        if addrs.is_empty() {
            result.set_connect_error(Arc::new(NoPublicAddrs));
            result.crawl_ended_at = SystemTime::now();
            return result;
        }

        result.connect_started_at = Some(SystemTime::now());
        let connected = self.connect(cancel, &result.info, &addrs).await;
        result.connect_ended_at = Some(SystemTime::now());

        let session = match connected {
            Ok(session) => Arc::new(session),
            Err(err) => {
                result.set_connect_error(Arc::from(err));
                debug!(
                    "Could not connect to {}: {}",
                    result.info.id(),
                    result.connect_error_display().unwrap_or_default()
                );
                result.crawl_ended_at = SystemTime::now();
                return result;
            }
        };

        let walk = drain_buckets(
            &session,
            result.info.id().clone(),
            result.info.kad_key(),
            &self.config.walk,
            cancel,
        )
        .await;
        result.first_response_at = walk.first_response_at;
        if let Some(err) = &walk.routing_table.error {
            result.set_crawl_error(err.clone());
        }
        result.routing_table = Some(walk.routing_table);

        match timeout(self.config.identify_timeout, session.identify()).await {
            Ok(Ok(identity)) => {
                result.agent = identity.agent;
                result.protocols = identity.protocols;
                result.listen_addrs = identity.listen_addrs;
            }
            Ok(Err(err)) => debug!("Could not identify {}: {err}", result.info.id()),
            Err(_) => debug!("Identify of {} timed out", result.info.id()),
        }

        session.close().await;
        result.crawl_ended_at = SystemTime::now();
        result
    }

    /// Dials the peer, retrying transient failures with backoff.
    async fn connect(
        &self,
        cancel: &CancellationToken,
        peer: &D::Peer,
        addrs: &[SocketAddr],
    ) -> Result<D::Session, BoxError> {
        let dialer = self.dialer.as_ref();
        let dial_timeout = self.config.dial_timeout;
        let max_elapsed = self.config.backoff.max_elapsed;

        retry(
            &self.config.backoff,
            cancel,
            || dial(dialer, peer, addrs, dial_timeout),
            |err: &BoxError| {
                let kind = NetError::classify(err.as_ref());
                if !kind.is_transient() {
                    return None;
                }
                if kind == NetError::ConnectionRefused {
                    return Some(max_elapsed.min(dial_timeout * 2));
                }
                Some(max_elapsed)
            },
        )
        .await
    }
}

impl<D: Dialer> Worker for CrawlWorker<D> {
    type Task = D::Peer;
    type Output = CrawlResult<D::Peer>;

    async fn work(
        &mut self,
        cancel: &CancellationToken,
        peer: D::Peer,
    ) -> Result<CrawlResult<D::Peer>, BoxError> {
        Ok(self.crawl(cancel, peer).await)
    }
}

/// Connects to peers once and records whether that worked.
pub struct DialWorker<D: Dialer> {
    id: String,
    dialer: Arc<D>,
    dial_timeout: Duration,
    addr_dial_type: AddrType,
}

impl<D: Dialer> DialWorker<D> {
    pub fn new(
        id: impl Into<String>,
        dialer: Arc<D>,
        dial_timeout: Duration,
        addr_dial_type: AddrType,
    ) -> Self {
        DialWorker {
            id: id.into(),
            dialer,
            dial_timeout,
            addr_dial_type,
        }
    }
}

impl<D: Dialer> Worker for DialWorker<D> {
    type Task = D::Peer;
    type Output = DialResult<D::Peer>;

    async fn work(
        &mut self,
        cancel: &CancellationToken,
        peer: D::Peer,
    ) -> Result<DialResult<D::Peer>, BoxError> {
        let mut result = DialResult::new(self.id.clone(), peer);

        let addrs = self.addr_dial_type.filter(result.info.addrs());
        if addrs.is_empty() {
            result.set_error(Arc::new(NoPublicAddrs));
            return Ok(result);
        }

        let dialed = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BoxError::from("dial cancelled")),
            dialed = dial(self.dialer.as_ref(), &result.info, &addrs, self.dial_timeout) => dialed,
        };
        result.dial_ended_at = SystemTime::now();

        match dialed {
            Ok(session) => session.close().await,
            Err(err) => {
                debug!("Could not dial {}: {err}", result.info.id());
                result.set_error(Arc::from(err));
            }
        }
        Ok(result)
    }
}

async fn dial<D: Dialer>(
    dialer: &D,
    peer: &D::Peer,
    addrs: &[SocketAddr],
    dial_timeout: Duration,
) -> Result<D::Session, BoxError> {
    match timeout(dial_timeout, dialer.dial(peer, addrs)).await {
        Ok(dialed) => dialed,
        Err(_) => Err(Box::new(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("dial timed out after {dial_timeout:?}"),
        ))),
    }
}
