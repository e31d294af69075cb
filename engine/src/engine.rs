//! The engine scheduling peers onto workers and results onto writers.
//!
//! The engine owns all scheduling state of a run: the queue of pending peers,
//! the queue of pending writes, the peers in flight and the peers that were
//! already processed. That state is only ever touched by the single loop in
//! [`Engine::run`], workers and writers talk to it through channels.
//!
//! A run ends once the driver's task source is exhausted and every queued,
//! in flight and pending write has been dealt with. Peer work has to settle
//! completely before the writers are told that no more writes will follow,
//! since every peer result produces a write.

use crate::addr::AddrType;
use crate::error::{BoxError, Cancelled, ConfigError, EngineError};
use crate::handler::Handler;
use crate::peer::{Keyed, PeerInfo};
use crate::pool::{Outcome, Pool, ResultStream, Worker};
use crate::queue::PeerQueue;
use crate::result::{WorkResult, WriteResult};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::future::pending;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Default number of concurrent peer workers.
const DEFAULT_WORKER_COUNT: usize = 100;
/// Default number of concurrent writers.
const DEFAULT_WRITER_COUNT: usize = 10;
/// Default interval between two status log lines.
const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Binds the engine to one network protocol.
///
/// A driver creates the workers that process peers, the writers that persist
/// their results and supplies the peers to start with.
pub trait Driver {
    /// The peers of the network.
    type Peer: PeerInfo;
    /// Result of processing a single peer.
    type Output: WorkResult<Peer = Self::Peer>;
    /// Worker processing peers.
    type Worker: Worker<Task = Self::Peer, Output = Self::Output>;
    /// Worker persisting results.
    type Writer: Worker<Task = Self::Output, Output = WriteResult>;

    /// Create a new peer worker.
    fn new_worker(&mut self) -> Result<Self::Worker, BoxError>;

    /// Create a new writer.
    fn new_writer(&mut self) -> Result<Self::Writer, BoxError>;

    /// Returns the source of peers to process.
    ///
    /// Called exactly once. The engine keeps running until this channel is
    /// closed and all work derived from it is done.
    fn tasks(&mut self) -> mpsc::Receiver<Self::Peer>;

    /// Releases all resources of the driver. Must tolerate repeated calls.
    fn close(&mut self);
}

/// Configuration of an [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of concurrent peer workers.
    pub worker_count: usize,
    /// Number of concurrent writers.
    pub writer_count: usize,
    /// Stop handing out peers once this many were processed, 0 for no limit.
    pub limit: usize,
    /// Process peers again even if they were already processed in this run.
    pub duplicate_processing: bool,
    /// Peers with an address of this type are processed first.
    pub addr_dial_type: AddrType,
    /// Interval between two status log lines.
    pub status_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            worker_count: DEFAULT_WORKER_COUNT,
            writer_count: DEFAULT_WRITER_COUNT,
            limit: 0,
            duplicate_processing: false,
            addr_dial_type: AddrType::Any,
            status_interval: DEFAULT_STATUS_INTERVAL,
        }
    }
}

impl EngineConfig {
    /// Checks the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.writer_count == 0 {
            return Err(ConfigError::ZeroWriters);
        }
        if self.status_interval.is_zero() {
            return Err(ConfigError::ZeroStatusInterval);
        }
        Ok(())
    }
}

/// Schedules peers of one network onto a pool of workers.
pub struct Engine<D: Driver, H: Handler<D::Output>> {
    config: EngineConfig,
    driver: D,
    handler: H,
    workers: Pool<D::Worker>,
    writers: Pool<D::Writer>,
    /// Source of new peers, `None` once exhausted.
    tasks: Option<mpsc::Receiver<D::Peer>>,
    peer_queue: PeerQueue<D::Peer>,
    /// Results waiting to be written, by peer key.
    write_queue: HashMap<String, D::Output>,
    inflight: HashSet<String>,
    processed: HashSet<String>,
    /// Number of handled peer results.
    handled: usize,
    /// Number of handled write results that performed a write.
    written: usize,
    ran: bool,
}

impl<D: Driver, H: Handler<D::Output>> Engine<D, H> {
    /// Create a new engine.
    ///
    /// Fails without starting anything if the configuration is invalid or the
    /// driver cannot create the requested workers and writers.
    pub fn new(config: EngineConfig, mut driver: D, handler: H) -> Result<Self, EngineError> {
        config.validate()?;

        let workers = (0..config.worker_count)
            .map(|_| driver.new_worker())
            .collect::<Result<Vec<_>, _>>()
            .map_err(EngineError::NewWorker)?;
        let writers = (0..config.writer_count)
            .map(|_| driver.new_writer())
            .collect::<Result<Vec<_>, _>>()
            .map_err(EngineError::NewWriter)?;
        let tasks = driver.tasks();

        Ok(Engine {
            peer_queue: PeerQueue::new(config.addr_dial_type),
            config,
            driver,
            handler,
            workers: Pool::new(workers),
            writers: Pool::new(writers),
            tasks: Some(tasks),
            write_queue: HashMap::new(),
            inflight: HashSet::new(),
            processed: HashSet::new(),
            handled: 0,
            written: 0,
            ran: false,
        })
    }

    /// Run until all peers were processed, the limit was reached or `cancel`
    /// fired.
    ///
    /// Reaching the limit stops handing out peers and reading the driver, but
    /// work already in flight still finishes and is written.
    ///
    /// # Returns
    ///
    /// * `Ok(remaining)` - Peers that were still queued when the run ended,
    ///   empty unless the limit was reached.
    /// * `Err(Cancelled)` - The run was cancelled, carrying the queued peers.
    ///   Peers in flight at that time are dropped.
    pub async fn run(
        &mut self,
        cancel: CancellationToken,
    ) -> Result<HashMap<String, D::Peer>, Cancelled<D::Peer>> {
        if self.ran {
            warn!("Engine already ran, not starting again");
            self.driver.close();
            return Ok(self.take_queue());
        }
        self.ran = true;

        info!(
            "Starting engine with {} workers and {} writers",
            self.workers.size(),
            self.writers.size()
        );

        let (peer_tx, peer_rx) = mpsc::channel(1);
        let (write_tx, write_rx) = mpsc::channel(1);
        let mut peer_tx = Some(peer_tx);
        let mut write_tx = Some(write_tx);
        let mut peer_results = Some(self.workers.start(cancel.clone(), peer_rx));
        let mut write_results = Some(self.writers.start(cancel.clone(), write_rx));

        let period = self.config.status_interval;
        let mut status = interval_at(Instant::now() + period, period);
        status.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut cancelled = false;
        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let limit_reached = self.reached_limit();
            let next_peer = if limit_reached {
                None
            } else {
                self.peer_queue.next_key().cloned()
            };
            let next_write = self.write_queue.keys().next().cloned();

            // No more peer work can ever show up.
            if next_peer.is_none()
                && peer_tx.is_some()
                && self.inflight.is_empty()
                && (self.tasks.is_none() || limit_reached)
            {
                debug!("Closing peer task channel");
                peer_tx = None;
            }

            // Workers are done, so no more writes can show up either.
            if peer_tx.is_none() && next_write.is_none() && write_tx.is_some() {
                debug!("Closing write task channel");
                write_tx = None;
            }

            if peer_results.is_none() && write_results.is_none() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                task = recv_task(&mut self.tasks), if !limit_reached => {
                    match task {
                        Some(peer) => self.enqueue(peer),
                        None => {
                            debug!("Driver task source exhausted");
                            self.tasks = None;
                        }
                    }
                }
                Some(permit) = reserve(&peer_tx), if next_peer.is_some() => {
                    if let Some(key) = next_peer.as_ref() {
                        if let Some(peer) = self.peer_queue.remove(key) {
                            self.inflight.insert(key.clone());
                            permit.send(peer);
                        }
                    }
                }
                Some(permit) = reserve(&write_tx), if next_write.is_some() => {
                    if let Some(key) = next_write.as_ref() {
                        if let Some(result) = self.write_queue.remove(key) {
                            permit.send(result);
                        }
                    }
                }
                outcome = recv_outcome(&peer_results) => {
                    match outcome {
                        Some(outcome) => self.handle_peer_result(outcome),
                        None => {
                            debug!("All workers exited");
                            peer_results = None;
                        }
                    }
                }
                outcome = recv_outcome(&write_results) => {
                    match outcome {
                        Some(outcome) => self.handle_write_result(outcome),
                        None => {
                            debug!("All writers exited");
                            write_results = None;
                        }
                    }
                }
                _ = status.tick() => self.log_status(),
            }
        }

        if cancelled {
            info!("Engine cancelled, waiting for workers and writers to exit");
            self.tasks = None;
            drop(peer_tx);
            drop(write_tx);
            if let Some(results) = peer_results {
                while results.recv().await.is_some() {}
            }
            if let Some(results) = write_results {
                while results.recv().await.is_some() {}
            }
        }

        self.driver.close();
        self.log_status();

        let remaining = self.take_queue();
        if cancelled {
            Err(Cancelled { remaining })
        } else {
            Ok(remaining)
        }
    }

    /// Queues a peer unless it is in flight or was already processed.
    fn enqueue(&mut self, peer: D::Peer) {
        let key = peer.key();
        if self.inflight.contains(&key) || self.processed.contains(&key) {
            return;
        }
        self.peer_queue.push(peer);
    }

    fn handle_peer_result(&mut self, outcome: Outcome<D::Output>) {
        // The key is released even if the worker failed.
        self.inflight.remove(&outcome.key);
        if !self.config.duplicate_processing {
            self.processed.insert(outcome.key.clone());
        }
        self.handled += 1;

        let next = self.handler.handle_peer_result(&outcome);

        let success = match outcome.result {
            Ok(result) => {
                let success = result.is_success();
                self.write_queue.insert(outcome.key.clone(), result);
                success
            }
            Err(_) => false,
        };

        for peer in next {
            self.enqueue(peer);
        }

        debug!(
            "Handled result of {} (success: {success}), queued: {}, inflight: {}, processed: {}",
            outcome.key,
            self.peer_queue.len(),
            self.inflight.len(),
            self.handled
        );
    }

    fn handle_write_result(&mut self, outcome: Outcome<WriteResult>) {
        self.handler.handle_write_result(&outcome);

        match &outcome.result {
            Ok(write) if !write.duration.is_zero() => {
                self.written += 1;
                debug!(
                    "Writer {} stored {} in {:?}, success: {}, written: {}",
                    write.writer_id,
                    write.peer_id,
                    write.duration,
                    write.error.is_none(),
                    self.written
                );
            }
            // Nothing was written, for example in a dry run.
            Ok(_) => {}
            Err(err) => warn!("Writer {} failed on {}: {err}", outcome.worker, outcome.key),
        }
    }

    fn reached_limit(&self) -> bool {
        self.config.limit > 0 && self.handled >= self.config.limit
    }

    fn take_queue(&mut self) -> HashMap<String, D::Peer> {
        let empty = PeerQueue::new(self.config.addr_dial_type);
        std::mem::replace(&mut self.peer_queue, empty).into_map()
    }

    fn log_status(&self) {
        info!(
            "Engine status: queued {}, inflight {}, processed {}, pending writes {}, written {}",
            self.peer_queue.len(),
            self.inflight.len(),
            self.handled,
            self.write_queue.len(),
            self.written
        );
    }

    /// Returns the handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Consumes the engine, returning the handler with its aggregates.
    pub fn into_handler(self) -> H {
        self.handler
    }

    /// Returns the number of peer results handled so far.
    pub fn processed(&self) -> usize {
        self.handled
    }

    /// Returns the number of results written so far.
    pub fn written(&self) -> usize {
        self.written
    }
}

async fn recv_task<T>(tasks: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match tasks {
        Some(tasks) => tasks.recv().await,
        None => pending().await,
    }
}

async fn reserve<T>(tx: &Option<mpsc::Sender<T>>) -> Option<mpsc::Permit<'_, T>> {
    match tx {
        Some(tx) => tx.reserve().await.ok(),
        None => pending().await,
    }
}

async fn recv_outcome<R>(results: &Option<ResultStream<R>>) -> Option<Outcome<R>> {
    match results {
        Some(results) => results.recv().await,
        None => pending().await,
    }
}
