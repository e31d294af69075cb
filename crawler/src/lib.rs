//! Crawler and dialer for Kademlia-style overlay networks.
//!
//! A [`Crawler`] discovers a network by walking the routing table buckets of
//! every peer it can reach, starting from a set of bootstrap peers. The wire
//! protocol stays behind the [`Dialer`] and [`Session`] traits, scheduling and
//! persistence are provided by [`overlay_crawler_engine`].

mod backoff;
mod builder;
mod crawler;
mod driver;
mod kademlia;
mod neighbors;
mod node;
mod summary;
mod transport;
mod worker;

#[cfg(test)]
mod testing;

pub use backoff::{retry, ExponentialBackoff};
pub use builder::{CrawlerBuilder, CrawlerBuilderError};
pub use crawler::{Crawler, CrawlerError};
pub use driver::{CrawlDriver, DialDriver, PeerSource};
pub use kademlia::{KadPeer, Key};
pub use neighbors::{drain_buckets, BucketError, Concurrency, Walk, WalkConfig, MAX_BUCKETS};
pub use node::{NodeId, NodeRecord, ParseNodeIdError};
pub use summary::{CrawlState, CrawlSummary};
pub use transport::{Dialer, FetchError, FindNode, Identity, Session};
pub use worker::{CrawlConfig, CrawlWorker, DialWorker};

// Re-exports.
pub use overlay_crawler_engine::{
    AddrType, BoxError, CrawlResult, DialHandler, DialResult, MemoryStore, NeighborsRecord,
    NetError, NoopStore, PeerInfo, StoreError, VisitRecord, VisitStore, VisitType,
};
