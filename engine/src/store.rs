//! Boundary to the persistence backend.
//!
//! Writers turn crawl and dial results into [`VisitRecord`]s, the crawler
//! facade turns archived routing tables into [`NeighborsRecord`]s. Both are
//! handed to a [`VisitStore`]. [`NoopStore`] discards everything,
//! [`MemoryStore`] keeps everything in memory and hands out incrementing
//! storage IDs, which is enough for tests and dry runs.

use crate::error::SharedError;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;

/// Kind of visit being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VisitType {
    Crawl,
    Dial,
}

impl fmt::Display for VisitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VisitType::Crawl => write!(f, "crawl"),
            VisitType::Dial => write!(f, "dial"),
        }
    }
}

/// A single visit of a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct VisitRecord {
    /// Identifier of the crawl run, if the backend tracks runs.
    pub crawl_id: Option<i64>,
    /// External identifier of the visited peer.
    pub peer_id: String,
    /// Addresses of the peer after address type filtering.
    pub addrs: Vec<SocketAddr>,
    pub protocols: Vec<String>,
    pub agent: Option<String>,
    pub visit_type: VisitType,
    pub connect_duration: Option<Duration>,
    pub crawl_duration: Option<Duration>,
    pub visit_started_at: SystemTime,
    pub visit_ended_at: SystemTime,
    /// Classified connect or dial error.
    pub connect_error: Option<String>,
    /// Classified crawl error.
    pub crawl_error: Option<String>,
    /// Opaque per peer properties as a JSON document.
    pub properties: Option<String>,
}

/// Routing table of a peer as it was observed during a crawl.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborsRecord {
    pub crawl_id: Option<i64>,
    /// External identifier of the peer the routing table belongs to.
    pub peer_id: String,
    /// Storage identifier of that peer, if it was written before.
    pub peer_storage_id: Option<i64>,
    /// Neighbors whose storage identifier is known.
    pub neighbor_storage_ids: Vec<i64>,
    /// Neighbors that were never written, by external identifier.
    pub neighbor_peer_ids: Vec<String>,
    /// Bit `i` is set if fetching bucket `i` failed.
    pub error_bits: u16,
}

/// Errors returned by a [`VisitStore`].
#[derive(Debug, Clone)]
pub enum StoreError {
    /// The store does not accept records anymore.
    Closed,
    /// The backend rejected the record.
    Backend(SharedError),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Closed => write!(f, "Store is closed"),
            StoreError::Backend(err) => write!(f, "Store backend error: {err}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StoreError::Closed => None,
            StoreError::Backend(err) => Some(err.as_ref()),
        }
    }
}

/// A persistence backend for visits and routing tables.
///
/// Stores are shared by all writers of an engine run and must therefore be
/// safe to use concurrently.
pub trait VisitStore: Send + Sync + 'static {
    /// Persists a visit.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(id))` - The storage identifier of the visited peer.
    /// * `Ok(None)` - The visit was accepted but the backend hands out no identifiers.
    /// * `Err(StoreError)` - The visit was not persisted.
    fn insert_visit(
        &self,
        visit: VisitRecord,
    ) -> impl Future<Output = Result<Option<i64>, StoreError>> + Send;

    /// Persists the routing table of a single peer.
    fn persist_neighbors(
        &self,
        neighbors: NeighborsRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// A store discarding all records.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStore;

impl VisitStore for NoopStore {
    async fn insert_visit(&self, _visit: VisitRecord) -> Result<Option<i64>, StoreError> {
        Ok(None)
    }

    async fn persist_neighbors(&self, _neighbors: NeighborsRecord) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    next_id: i64,
    peer_ids: HashMap<String, i64>,
    visits: Vec<VisitRecord>,
    neighbors: Vec<NeighborsRecord>,
}

/// A store keeping all records in memory.
///
/// Every distinct peer gets a storage identifier on its first visit, further
/// visits of the same peer resolve to the same identifier.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all visits in insertion order.
    pub async fn visits(&self) -> Vec<VisitRecord> {
        self.inner.lock().await.visits.clone()
    }

    /// Returns all routing tables in insertion order.
    pub async fn neighbors(&self) -> Vec<NeighborsRecord> {
        self.inner.lock().await.neighbors.clone()
    }

    /// Returns the storage identifier of a peer, if it was visited.
    pub async fn storage_id(&self, peer_id: &str) -> Option<i64> {
        self.inner.lock().await.peer_ids.get(peer_id).copied()
    }
}

impl VisitStore for MemoryStore {
    async fn insert_visit(&self, visit: VisitRecord) -> Result<Option<i64>, StoreError> {
        let mut inner = self.inner.lock().await;

        let id = match inner.peer_ids.get(&visit.peer_id) {
            Some(id) => *id,
            None => {
                inner.next_id += 1;
                let id = inner.next_id;
                inner.peer_ids.insert(visit.peer_id.clone(), id);
                id
            }
        };
        inner.visits.push(visit);

        Ok(Some(id))
    }

    async fn persist_neighbors(&self, neighbors: NeighborsRecord) -> Result<(), StoreError> {
        self.inner.lock().await.neighbors.push(neighbors);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visit(peer_id: &str) -> VisitRecord {
        let now = SystemTime::now();
        VisitRecord {
            crawl_id: Some(1),
            peer_id: peer_id.to_string(),
            addrs: vec![],
            protocols: vec![],
            agent: None,
            visit_type: VisitType::Crawl,
            connect_duration: None,
            crawl_duration: None,
            visit_started_at: now,
            visit_ended_at: now,
            connect_error: None,
            crawl_error: None,
            properties: None,
        }
    }

    #[tokio::test]
    async fn test_memory_store_reuses_peer_ids() {
        let store = MemoryStore::new();

        let a = store.insert_visit(visit("a")).await.unwrap();
        let b = store.insert_visit(visit("b")).await.unwrap();
        let a_again = store.insert_visit(visit("a")).await.unwrap();

        assert_eq!(a, Some(1));
        assert_eq!(b, Some(2));
        assert_eq!(a_again, a);
        assert_eq!(store.visits().await.len(), 3);
        assert_eq!(store.storage_id("b").await, Some(2));
        assert_eq!(store.storage_id("c").await, None);
    }

    #[tokio::test]
    async fn test_noop_store() {
        let store = NoopStore;
        assert_eq!(store.insert_visit(visit("a")).await.unwrap(), None);
        assert!(store
            .persist_neighbors(NeighborsRecord {
                crawl_id: None,
                peer_id: "a".to_string(),
                peer_storage_id: None,
                neighbor_storage_ids: vec![],
                neighbor_peer_ids: vec![],
                error_bits: 0,
            })
            .await
            .is_ok());
    }
}
