//! A generic engine for crawling and dialing peer-to-peer overlay networks.
//!
//! The [`Engine`] knows nothing about a concrete network. A [`Driver`] binds it
//! to one by creating [`Worker`]s that process peers and writers that persist
//! the results, a [`Handler`] decides which peers follow from each result.

mod addr;
mod engine;
mod error;
mod handler;
mod peer;
mod pool;
mod queue;
mod result;
mod store;
mod writer;

pub use addr::{is_public, AddrType, ParseAddrTypeError};
pub use engine::{Driver, Engine, EngineConfig};
pub use error::{
    BoxError, Cancelled, ConfigError, EngineError, NetError, NoPublicAddrs, SharedError,
};
pub use handler::{CrawlHandler, CrawlHandlerConfig, DialHandler, Handler};
pub use peer::{Keyed, PeerInfo};
pub use pool::{Outcome, Pool, ResultStream, Worker};
pub use queue::PeerQueue;
pub use result::{CrawlResult, DialResult, RoutingTable, WorkResult, WriteResult};
pub use store::{
    MemoryStore, NeighborsRecord, NoopStore, StoreError, VisitRecord, VisitStore, VisitType,
};
pub use writer::{CrawlWriter, DialWriter};
