//! Writers persisting crawl and dial results.

use crate::addr::AddrType;
use crate::error::BoxError;
use crate::peer::PeerInfo;
use crate::pool::Worker;
use crate::result::{CrawlResult, DialResult, WriteResult};
use crate::store::{VisitRecord, VisitStore, VisitType};
use log::{debug, warn};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Persists crawl results as visits.
///
/// A failed insert is logged and reported through [`WriteResult::error`], it
/// never fails the writer itself.
pub struct CrawlWriter<I, S> {
    id: String,
    store: Arc<S>,
    crawl_id: Option<i64>,
    /// Addresses of this type are stored, all others are dropped.
    addr_track_type: AddrType,
    written: usize,
    _peer: PhantomData<fn() -> I>,
}

impl<I: PeerInfo, S: VisitStore> CrawlWriter<I, S> {
    pub fn new(
        id: impl Into<String>,
        store: Arc<S>,
        crawl_id: Option<i64>,
        addr_track_type: AddrType,
    ) -> Self {
        CrawlWriter {
            id: id.into(),
            store,
            crawl_id,
            addr_track_type,
            written: 0,
            _peer: PhantomData,
        }
    }

    /// Returns the number of visits this writer stored.
    pub fn written(&self) -> usize {
        self.written
    }

    fn visit(&self, result: &CrawlResult<I>) -> VisitRecord {
        let mut addrs = self.addr_track_type.filter(result.info.addrs());
        for addr in self.addr_track_type.filter(&result.listen_addrs) {
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }

        VisitRecord {
            crawl_id: self.crawl_id,
            peer_id: result.info.id().to_string(),
            addrs,
            protocols: result.protocols.clone(),
            agent: result.agent.clone(),
            visit_type: VisitType::Crawl,
            connect_duration: result.connect_duration(),
            crawl_duration: Some(result.crawl_duration()),
            visit_started_at: result.crawl_started_at,
            visit_ended_at: result.crawl_ended_at,
            connect_error: result.connect_error_kind.map(|kind| kind.to_string()),
            crawl_error: result.crawl_error_kind.map(|kind| kind.to_string()),
            properties: result.properties.clone(),
        }
    }
}

impl<I: PeerInfo, S: VisitStore> Worker for CrawlWriter<I, S> {
    type Task = CrawlResult<I>;
    type Output = WriteResult;

    async fn work(
        &mut self,
        _cancel: &CancellationToken,
        result: CrawlResult<I>,
    ) -> Result<WriteResult, BoxError> {
        let peer_id = result.info.id().to_string();
        debug!("Writer {} storing peer {peer_id}", self.id);

        let visit = self.visit(&result);
        let start = Instant::now();
        let inserted = self.store.insert_visit(visit).await;
        let duration = start.elapsed();

        let (storage_id, error) = match inserted {
            Ok(storage_id) => {
                self.written += 1;
                (storage_id, None)
            }
            Err(err) => {
                warn!("Writer {} failed to insert visit of {peer_id}: {err}", self.id);
                (None, Some(err))
            }
        };

        Ok(WriteResult {
            writer_id: self.id.clone(),
            peer_id,
            storage_id,
            duration,
            error,
        })
    }
}

/// Persists dial results as visits.
pub struct DialWriter<I, S> {
    id: String,
    store: Arc<S>,
    _peer: PhantomData<fn() -> I>,
}

impl<I: PeerInfo, S: VisitStore> DialWriter<I, S> {
    pub fn new(id: impl Into<String>, store: Arc<S>) -> Self {
        DialWriter {
            id: id.into(),
            store,
            _peer: PhantomData,
        }
    }
}

impl<I: PeerInfo, S: VisitStore> Worker for DialWriter<I, S> {
    type Task = DialResult<I>;
    type Output = WriteResult;

    async fn work(
        &mut self,
        _cancel: &CancellationToken,
        result: DialResult<I>,
    ) -> Result<WriteResult, BoxError> {
        let peer_id = result.info.id().to_string();
        let visit = VisitRecord {
            crawl_id: None,
            peer_id: peer_id.clone(),
            addrs: result.info.addrs().to_vec(),
            protocols: Vec::new(),
            agent: None,
            visit_type: VisitType::Dial,
            connect_duration: Some(result.dial_duration()),
            crawl_duration: None,
            visit_started_at: result.dial_started_at,
            visit_ended_at: result.dial_ended_at,
            connect_error: result.dial_error.map(|kind| kind.to_string()),
            crawl_error: None,
            properties: None,
        };

        let start = Instant::now();
        let (storage_id, error) = match self.store.insert_visit(visit).await {
            Ok(storage_id) => (storage_id, None),
            Err(err) => {
                warn!("Writer {} failed to insert dial of {peer_id}: {err}", self.id);
                (None, Some(err))
            }
        };

        Ok(WriteResult {
            writer_id: self.id.clone(),
            peer_id,
            storage_id,
            duration: start.elapsed(),
            error,
        })
    }
}
