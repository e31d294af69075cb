//! Results produced by peer workers and writers.

use crate::error::{NetError, SharedError};
use crate::peer::{Keyed, PeerInfo};
use crate::store::StoreError;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

/// Output of a peer worker, consumed by handlers and writers.
pub trait WorkResult: Keyed + Send + 'static {
    /// The peer type the result is about.
    type Peer: PeerInfo;

    /// Returns the peer this result belongs to.
    fn peer_info(&self) -> &Self::Peer;

    /// Checks if the peer was processed without any error.
    fn is_success(&self) -> bool;
}

/// The neighbors a single peer reported during a crawl.
#[derive(Debug, Clone)]
pub struct RoutingTable<I: PeerInfo> {
    /// The peer the routing table belongs to.
    pub peer_id: I::Id,
    /// All distinct peers the peer reported.
    pub neighbors: Vec<I>,
    /// The first error that occurred while fetching buckets.
    pub error: Option<SharedError>,
    /// Bit `i` is set if fetching bucket `i` failed.
    pub error_bits: u16,
    /// Number of buckets that were fetched, starting at bucket 0.
    pub buckets: usize,
}

impl<I: PeerInfo> RoutingTable<I> {
    /// Create an empty routing table of all 16 buckets without any errors.
    pub fn new(peer_id: I::Id) -> Self {
        RoutingTable {
            peer_id,
            neighbors: Vec::new(),
            error: None,
            error_bits: 0,
            buckets: u16::BITS as usize,
        }
    }

    /// Returns the error bits of a table where every fetched bucket failed.
    pub fn walked_mask(&self) -> u16 {
        match self.buckets {
            0 => 0,
            b if b >= u16::BITS as usize => u16::MAX,
            b => (1 << b) - 1,
        }
    }

    /// Checks if every bucket fetch failed.
    pub fn all_failed(&self) -> bool {
        let mask = self.walked_mask();
        mask != 0 && self.error_bits & mask == mask
    }

    /// Returns the number of failed bucket fetches.
    pub fn failed_buckets(&self) -> u32 {
        self.error_bits.count_ones()
    }
}

/// Everything gathered while crawling a single peer.
#[derive(Debug, Clone)]
pub struct CrawlResult<I: PeerInfo> {
    /// The worker that produced this result.
    pub crawler_id: String,
    /// The crawled peer, including any addresses learned while crawling it.
    pub info: I,
    /// The neighbors the peer reported.
    pub routing_table: Option<RoutingTable<I>>,
    /// The agent version the peer advertised.
    pub agent: Option<String>,
    /// The protocols the peer supports.
    pub protocols: Vec<String>,
    /// Addresses the peer claims to listen on.
    pub listen_addrs: Vec<SocketAddr>,
    /// The routing table was obtained from a side channel API. Such entries
    /// carry no addresses and are not crawled further.
    pub routing_table_from_api: bool,
    pub connect_error: Option<SharedError>,
    /// The connect error mapped onto a known kind.
    pub connect_error_kind: Option<NetError>,
    pub crawl_error: Option<SharedError>,
    /// The crawl error mapped onto a known kind.
    pub crawl_error_kind: Option<NetError>,
    pub connect_started_at: Option<SystemTime>,
    pub connect_ended_at: Option<SystemTime>,
    /// When the first bucket request succeeded.
    pub first_response_at: Option<SystemTime>,
    pub crawl_started_at: SystemTime,
    pub crawl_ended_at: SystemTime,
    /// Opaque per peer properties as a JSON document.
    pub properties: Option<String>,
    /// Log raw errors instead of their kind.
    pub log_errors: bool,
}

impl<I: PeerInfo> CrawlResult<I> {
    /// Create an empty result for a crawl starting now.
    pub fn new(crawler_id: impl Into<String>, info: I) -> Self {
        let now = SystemTime::now();
        CrawlResult {
            crawler_id: crawler_id.into(),
            info,
            routing_table: None,
            agent: None,
            protocols: Vec::new(),
            listen_addrs: Vec::new(),
            routing_table_from_api: false,
            connect_error: None,
            connect_error_kind: None,
            crawl_error: None,
            crawl_error_kind: None,
            connect_started_at: None,
            connect_ended_at: None,
            first_response_at: None,
            crawl_started_at: now,
            crawl_ended_at: now,
            properties: None,
            log_errors: false,
        }
    }

    /// Records the connect error together with its kind.
    pub fn set_connect_error(&mut self, err: SharedError) {
        self.connect_error_kind = Some(NetError::classify(err.as_ref()));
        self.connect_error = Some(err);
    }

    /// Records the crawl error together with its kind.
    pub fn set_crawl_error(&mut self, err: SharedError) {
        self.crawl_error_kind = Some(NetError::classify(err.as_ref()));
        self.crawl_error = Some(err);
    }

    /// Returns the time spent connecting to the peer.
    pub fn connect_duration(&self) -> Option<Duration> {
        let start = self.connect_started_at?;
        let end = self.connect_ended_at?;
        end.duration_since(start).ok()
    }

    /// Returns the time spent crawling the peer, connecting included.
    pub fn crawl_duration(&self) -> Duration {
        self.crawl_ended_at
            .duration_since(self.crawl_started_at)
            .unwrap_or_default()
    }

    /// Returns the connect error for logging, raw or as its kind.
    pub fn connect_error_display(&self) -> Option<String> {
        display_error(
            self.connect_error.as_ref(),
            self.connect_error_kind,
            self.log_errors,
        )
    }

    /// Returns the crawl error for logging, raw or as its kind.
    pub fn crawl_error_display(&self) -> Option<String> {
        display_error(
            self.crawl_error.as_ref(),
            self.crawl_error_kind,
            self.log_errors,
        )
    }
}

fn display_error(
    err: Option<&SharedError>,
    kind: Option<NetError>,
    raw: bool,
) -> Option<String> {
    let err = err?;
    match kind {
        Some(kind) if !raw && kind != NetError::Unknown => Some(kind.to_string()),
        _ => Some(err.to_string()),
    }
}

impl<I: PeerInfo> Keyed for CrawlResult<I> {
    fn key(&self) -> String {
        self.info.key()
    }
}

impl<I: PeerInfo> WorkResult for CrawlResult<I> {
    type Peer = I;

    fn peer_info(&self) -> &I {
        &self.info
    }

    fn is_success(&self) -> bool {
        self.connect_error.is_none() && self.crawl_error.is_none()
    }
}

/// Outcome of dialing a single peer.
#[derive(Debug, Clone)]
pub struct DialResult<I: PeerInfo> {
    /// The worker that produced this result.
    pub dialer_id: String,
    pub info: I,
    pub error: Option<SharedError>,
    /// The dial error mapped onto a known kind.
    pub dial_error: Option<NetError>,
    pub dial_started_at: SystemTime,
    pub dial_ended_at: SystemTime,
}

impl<I: PeerInfo> DialResult<I> {
    /// Create a successful result for a dial starting now.
    pub fn new(dialer_id: impl Into<String>, info: I) -> Self {
        let now = SystemTime::now();
        DialResult {
            dialer_id: dialer_id.into(),
            info,
            error: None,
            dial_error: None,
            dial_started_at: now,
            dial_ended_at: now,
        }
    }

    /// Records the dial error together with its kind.
    pub fn set_error(&mut self, err: SharedError) {
        self.dial_error = Some(NetError::classify(err.as_ref()));
        self.error = Some(err);
    }

    pub fn dial_duration(&self) -> Duration {
        self.dial_ended_at
            .duration_since(self.dial_started_at)
            .unwrap_or_default()
    }
}

impl<I: PeerInfo> Keyed for DialResult<I> {
    fn key(&self) -> String {
        self.info.key()
    }
}

impl<I: PeerInfo> WorkResult for DialResult<I> {
    type Peer = I;

    fn peer_info(&self) -> &I {
        &self.info
    }

    fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of persisting a crawl or dial result.
#[derive(Debug, Clone)]
pub struct WriteResult {
    /// The writer that produced this result.
    pub writer_id: String,
    /// External identifier of the written peer.
    pub peer_id: String,
    /// Storage identifier of the written peer, if the store hands them out.
    pub storage_id: Option<i64>,
    /// Time spent writing. Zero if nothing was written.
    pub duration: Duration,
    pub error: Option<StoreError>,
}
