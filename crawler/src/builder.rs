//! Builder pattern for configuring and creating crawler instances.

use crate::backoff::ExponentialBackoff;
use crate::crawler::Crawler;
use crate::neighbors::{Concurrency, MAX_BUCKETS};
use crate::transport::Dialer;
use crate::worker::CrawlConfig;
use overlay_crawler_engine::{AddrType, ConfigError, EngineConfig};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Errors that can occur during crawler configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlerBuilderError {
    /// The engine settings are unusable.
    InvalidConfig(ConfigError),
    /// A zero dial timeout would fail every connection attempt.
    ZeroDialTimeout,
    /// Bucket count outside of `1..=16`.
    InvalidBuckets(usize),
}

impl fmt::Display for CrawlerBuilderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrawlerBuilderError::InvalidConfig(err) => write!(f, "Invalid configuration: {err}"),
            CrawlerBuilderError::ZeroDialTimeout => write!(f, "Dial timeout must not be zero"),
            CrawlerBuilderError::InvalidBuckets(buckets) => {
                write!(f, "Invalid bucket count {buckets}, expected 1 to {MAX_BUCKETS}")
            }
        }
    }
}

impl std::error::Error for CrawlerBuilderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CrawlerBuilderError::InvalidConfig(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConfigError> for CrawlerBuilderError {
    fn from(err: ConfigError) -> Self {
        CrawlerBuilderError::InvalidConfig(err)
    }
}

/// Builder for creating a customized [`Crawler`] instance.
pub struct CrawlerBuilder<D: Dialer> {
    dialer: Arc<D>,
    engine: EngineConfig,
    crawl: CrawlConfig,
    /// Addresses of this type are stored with visits.
    addr_track_type: AddrType,
    /// Keep routing tables for neighbor persistence.
    track_neighbors: bool,
    crawl_id: Option<i64>,
}

impl<D: Dialer> CrawlerBuilder<D> {
    /// Create a new crawler builder for the network `dialer` connects to.
    ///
    /// # Arguments
    ///
    /// * `dialer` - Opens sessions to peers of the network to crawl.
    ///
    /// # Returns
    ///
    /// A new `CrawlerBuilder` instance.
    pub fn new(dialer: D) -> Self {
        CrawlerBuilder {
            dialer: Arc::new(dialer),
            engine: EngineConfig::default(),
            crawl: CrawlConfig::default(),
            addr_track_type: AddrType::Public,
            track_neighbors: false,
            crawl_id: None,
        }
    }

    /// Set the number of peers crawled at the same time.
    ///
    /// # Arguments
    ///
    /// * `workers` - Number of crawl workers (defaults to 100).
    ///
    /// # Returns
    ///
    /// Self for method chaining.
    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.engine.worker_count = workers;
        self
    }

    /// Set the number of results written at the same time.
    ///
    /// # Arguments
    ///
    /// * `writers` - Number of writers (defaults to 10).
    ///
    /// # Returns
    ///
    /// Self for method chaining.
    pub fn with_writer_count(mut self, writers: usize) -> Self {
        self.engine.writer_count = writers;
        self
    }

    /// Stop the crawl after this many peers, 0 for no limit.
    ///
    /// Peers in flight when the limit is reached still finish.
    ///
    /// # Returns
    ///
    /// Self for method chaining.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.engine.limit = limit;
        self
    }

    /// Set which addresses are dialed.
    ///
    /// Peers without an address of this type are not dialed and are recorded
    /// as undialable.
    ///
    /// # Arguments
    ///
    /// * `addr_type` - Address type to dial (defaults to public addresses).
    ///
    /// # Returns
    ///
    /// Self for method chaining.
    pub fn with_addr_dial_type(mut self, addr_type: AddrType) -> Self {
        self.engine.addr_dial_type = addr_type;
        self.crawl.addr_dial_type = addr_type;
        self
    }

    /// Set which addresses are stored with visits.
    ///
    /// # Returns
    ///
    /// Self for method chaining.
    pub fn with_addr_track_type(mut self, addr_type: AddrType) -> Self {
        self.addr_track_type = addr_type;
        self
    }

    /// Set the timeout of a single connection attempt.
    ///
    /// Refused connections are retried for at most twice this long.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Maximum time per attempt (defaults to 60 seconds).
    ///
    /// # Returns
    ///
    /// Self for method chaining.
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.crawl.dial_timeout = timeout;
        self
    }

    /// Set how long to wait for a peer to identify itself.
    ///
    /// # Returns
    ///
    /// Self for method chaining.
    pub fn with_identify_timeout(mut self, timeout: Duration) -> Self {
        self.crawl.identify_timeout = timeout;
        self
    }

    /// Set the retry schedule for transient connect failures.
    ///
    /// # Returns
    ///
    /// Self for method chaining.
    pub fn with_connect_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.crawl.backoff = backoff;
        self
    }

    /// Set the number of routing table buckets fetched per peer.
    ///
    /// # Arguments
    ///
    /// * `buckets` - Between 1 and 16 (defaults to 16).
    ///
    /// # Returns
    ///
    /// Self for method chaining.
    pub fn with_buckets(mut self, buckets: usize) -> Self {
        self.crawl.walk.buckets = buckets;
        self
    }

    /// Set how the buckets of a single peer are fetched.
    ///
    /// Transports that cannot multiplex streams need
    /// [`Concurrency::Sequential`], which is the default.
    ///
    /// # Returns
    ///
    /// Self for method chaining.
    pub fn with_walk_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.crawl.walk.concurrency = concurrency;
        self
    }

    /// Set the unit of the linear backoff between bucket retries.
    ///
    /// # Returns
    ///
    /// Self for method chaining.
    pub fn with_bucket_retry_backoff(mut self, backoff: Duration) -> Self {
        self.crawl.walk.retry_backoff = backoff;
        self
    }

    /// Keep routing tables in memory and persist them after the crawl.
    ///
    /// # Returns
    ///
    /// Self for method chaining.
    pub fn with_track_neighbors(mut self, track: bool) -> Self {
        self.track_neighbors = track;
        self
    }

    /// Set the crawl ID stored with every visit and neighbor record.
    ///
    /// # Returns
    ///
    /// Self for method chaining.
    pub fn with_crawl_id(mut self, crawl_id: i64) -> Self {
        self.crawl_id = Some(crawl_id);
        self
    }

    /// Log raw errors instead of their kind.
    ///
    /// # Returns
    ///
    /// Self for method chaining.
    pub fn with_log_errors(mut self, log_errors: bool) -> Self {
        self.crawl.log_errors = log_errors;
        self
    }

    /// Set the interval between two status log lines.
    ///
    /// # Returns
    ///
    /// Self for method chaining.
    pub fn with_status_interval(mut self, interval: Duration) -> Self {
        self.engine.status_interval = interval;
        self
    }

    /// Build the crawler with the configured options.
    ///
    /// # Returns
    ///
    /// * `Ok(Crawler)` - A configured `Crawler` instance.
    /// * `Err(CrawlerBuilderError)` - If a setting is out of range.
    pub fn build(self) -> Result<Crawler<D>, CrawlerBuilderError> {
        self.engine.validate()?;
        if self.crawl.dial_timeout.is_zero() {
            return Err(CrawlerBuilderError::ZeroDialTimeout);
        }
        let buckets = self.crawl.walk.buckets;
        if buckets == 0 || buckets > MAX_BUCKETS {
            return Err(CrawlerBuilderError::InvalidBuckets(buckets));
        }

        Ok(Crawler::new(
            self.dialer,
            self.engine,
            self.crawl,
            self.addr_track_type,
            self.track_neighbors,
            self.crawl_id,
        ))
    }
}
