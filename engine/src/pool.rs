//! A pool of homogeneous workers consuming one shared task channel.
//!
//! Each worker runs in its own tokio task and publishes an [`Outcome`] for
//! every task it processes on a result channel shared by the whole pool. The
//! result channel is closed once every worker has exited, which happens after
//! the task channel was closed and drained.

use crate::error::BoxError;
use crate::peer::Keyed;
use futures::FutureExt;
use log::{debug, error};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// A unit of concurrency: processes tasks of one type into outputs of another.
///
/// Peer workers turn peer information into crawl or dial results, writers turn
/// those results into write results. A single worker instance is only ever
/// driven by its own tokio task.
pub trait Worker: Send + 'static {
    /// The task consumed by this worker.
    type Task: Keyed + Send + 'static;
    /// The output produced for each task.
    type Output: Send + 'static;

    /// Processes one task.
    ///
    /// Long running I/O should observe `cancel` and return early once it fires.
    /// An error does not stop the pool, it is carried to the consumer inside
    /// the [`Outcome`]. A panic is caught and carried as an error as well,
    /// the worker keeps processing tasks afterwards.
    fn work(
        &mut self,
        cancel: &CancellationToken,
        task: Self::Task,
    ) -> impl Future<Output = Result<Self::Output, BoxError>> + Send;
}

/// Envelope published for every task a pool has processed.
#[derive(Debug)]
pub struct Outcome<R> {
    /// Index of the worker inside its pool.
    pub worker: usize,
    /// Key of the processed task.
    pub key: String,
    /// The worker output or the error it returned.
    pub result: Result<R, BoxError>,
}

/// Receiving half of a pool's shared result channel.
///
/// Cloning yields a handle to the same underlying channel.
#[derive(Debug)]
pub struct ResultStream<R> {
    inner: Arc<Mutex<mpsc::Receiver<Outcome<R>>>>,
}

impl<R> Clone for ResultStream<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R> ResultStream<R> {
    fn new(rx: mpsc::Receiver<Outcome<R>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(rx)),
        }
    }

    /// Receives the next outcome, or `None` once every worker has exited.
    ///
    /// Cancel safe, no outcome is lost if the returned future is dropped.
    pub async fn recv(&self) -> Option<Outcome<R>> {
        self.inner.lock().await.recv().await
    }

    /// Checks if both handles refer to the same result channel.
    pub fn same_stream(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// A pool managing a fixed set of [`Worker`]s.
pub struct Pool<W: Worker> {
    /// Workers waiting to be started, emptied by the first start.
    workers: Vec<W>,
    size: usize,
    /// Set once the pool was started.
    results: Option<ResultStream<W::Output>>,
}

impl<W: Worker> Pool<W> {
    /// Create a new pool from the given workers.
    pub fn new(workers: Vec<W>) -> Self {
        Pool {
            size: workers.len(),
            workers,
            results: None,
        }
    }

    /// Start all workers reading from `tasks`.
    ///
    /// Workers pull tasks as fast as they can process them. Close the task
    /// channel (drop all senders) to stop the pool, and wait until the
    /// returned stream yields `None` to know all workers have finished.
    ///
    /// Starting an already started pool spawns nothing and returns a handle
    /// to the original result channel, the new task channel is dropped.
    pub fn start(
        &mut self,
        cancel: CancellationToken,
        tasks: mpsc::Receiver<W::Task>,
    ) -> ResultStream<W::Output> {
        if let Some(results) = &self.results {
            return results.clone();
        }

        let (results_tx, results_rx) = mpsc::channel(self.size.max(1));
        let tasks = Arc::new(Mutex::new(tasks));

        for (id, mut worker) in self.workers.drain(..).enumerate() {
            let tasks = tasks.clone();
            let results_tx = results_tx.clone();
            let cancel = cancel.clone();

            tokio::spawn(async move {
                loop {
                    let task = tasks.lock().await.recv().await;
                    let Some(task) = task else {
                        break;
                    };

                    let key = task.key();
                    let work = AssertUnwindSafe(worker.work(&cancel, task));
                    let result = match work.catch_unwind().await {
                        Ok(result) => result,
                        Err(panic) => {
                            let message = panic_message(panic.as_ref());
                            error!("Worker {id} panicked on task {key}: {message}");
                            Err(format!("worker panicked: {message}").into())
                        }
                    };
                    let outcome = Outcome {
                        worker: id,
                        key,
                        result,
                    };

                    if results_tx.send(outcome).await.is_err() {
                        // Nobody is listening anymore.
                        break;
                    }
                }
                debug!("Worker {id} exited");
            });
        }

        let results = ResultStream::new(results_rx);
        self.results = Some(results.clone());
        results
    }

    /// Returns the number of workers in this pool.
    pub fn size(&self) -> usize {
        self.size
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug)]
    struct Job(u32);

    impl Keyed for Job {
        fn key(&self) -> String {
            self.0.to_string()
        }
    }

    /// Doubles the job number, fails on odd numbers if asked to.
    struct Doubler {
        calls: Arc<AtomicUsize>,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
        fail_odd: bool,
        delay: Duration,
    }

    impl Worker for Doubler {
        type Task = Job;
        type Output = u32;

        async fn work(&mut self, _cancel: &CancellationToken, task: Job) -> Result<u32, BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.fail_odd && task.0 % 2 == 1 {
                return Err(format!("odd job {}", task.0).into());
            }
            Ok(task.0 * 2)
        }
    }

    struct Counters {
        calls: Arc<AtomicUsize>,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
    }

    fn doublers(n: usize, fail_odd: bool, delay: Duration) -> (Vec<Doubler>, Counters) {
        let counters = Counters {
            calls: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        };
        let workers = (0..n)
            .map(|_| Doubler {
                calls: counters.calls.clone(),
                active: counters.active.clone(),
                max_active: counters.max_active.clone(),
                fail_odd,
                delay,
            })
            .collect();
        (workers, counters)
    }

    async fn collect(results: ResultStream<u32>) -> Vec<Outcome<u32>> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = results.recv().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    #[tokio::test]
    async fn test_pool_processes_all_tasks() {
        let (workers, counters) = doublers(3, false, Duration::from_millis(1));
        let mut pool = Pool::new(workers);
        assert_eq!(pool.size(), 3);

        let (tx, rx) = mpsc::channel(16);
        let results = pool.start(CancellationToken::new(), rx);
        for i in 0..10 {
            tx.send(Job(i)).await.unwrap();
        }
        drop(tx);

        let outcomes = collect(results).await;
        assert_eq!(outcomes.len(), 10);
        assert_eq!(counters.calls.load(Ordering::SeqCst), 10);

        let values: HashSet<u32> = outcomes
            .iter()
            .map(|o| *o.result.as_ref().unwrap())
            .collect();
        assert_eq!(values, (0..10).map(|i| i * 2).collect());
        assert!(outcomes.iter().all(|o| o.worker < 3));
    }

    #[tokio::test]
    async fn test_pool_start_is_idempotent() {
        let (workers, counters) = doublers(3, false, Duration::from_millis(30));
        let mut pool = Pool::new(workers);

        let (tx, rx) = mpsc::channel(16);
        let first = pool.start(CancellationToken::new(), rx);

        // A second start must neither spawn new workers nor consume tasks.
        let (other_tx, other_rx) = mpsc::channel(16);
        let second = pool.start(CancellationToken::new(), other_rx);
        assert!(first.same_stream(&second));
        assert!(other_tx.send(Job(100)).await.is_err());

        for i in 0..9 {
            tx.send(Job(i)).await.unwrap();
        }
        drop(tx);

        let outcomes = collect(second).await;
        assert_eq!(outcomes.len(), 9);
        assert_eq!(counters.calls.load(Ordering::SeqCst), 9);
        assert!(counters.max_active.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_pool_carries_errors() {
        let (workers, _counters) = doublers(2, true, Duration::ZERO);
        let mut pool = Pool::new(workers);

        let (tx, rx) = mpsc::channel(16);
        let results = pool.start(CancellationToken::new(), rx);
        for i in 0..6 {
            tx.send(Job(i)).await.unwrap();
        }
        drop(tx);

        let outcomes = collect(results).await;
        assert_eq!(outcomes.len(), 6);

        let failed: HashSet<String> = outcomes
            .iter()
            .filter(|o| o.result.is_err())
            .map(|o| o.key.clone())
            .collect();
        assert_eq!(
            failed,
            ["1", "3", "5"].iter().map(|s| s.to_string()).collect()
        );
    }

    /// Panics on job 13.
    struct Superstitious;

    impl Worker for Superstitious {
        type Task = Job;
        type Output = u32;

        async fn work(&mut self, _cancel: &CancellationToken, task: Job) -> Result<u32, BoxError> {
            if task.0 == 13 {
                panic!("refusing job 13");
            }
            Ok(task.0)
        }
    }

    #[tokio::test]
    async fn test_pool_survives_panicking_worker() {
        let mut pool = Pool::new(vec![Superstitious]);

        let (tx, rx) = mpsc::channel(16);
        let results = pool.start(CancellationToken::new(), rx);
        for i in [12, 13, 14] {
            tx.send(Job(i)).await.unwrap();
        }
        drop(tx);

        let outcomes = collect(results).await;
        assert_eq!(outcomes.len(), 3);

        let failed: Vec<&Outcome<u32>> = outcomes.iter().filter(|o| o.result.is_err()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].key, "13");
        let err = failed[0].result.as_ref().unwrap_err().to_string();
        assert!(err.contains("refusing job 13"), "{err}");
    }

    #[tokio::test]
    async fn test_pool_closes_results_without_tasks() {
        let (workers, counters) = doublers(4, false, Duration::ZERO);
        let mut pool = Pool::new(workers);

        let (tx, rx) = mpsc::channel::<Job>(1);
        let results = pool.start(CancellationToken::new(), rx);
        drop(tx);

        assert!(collect(results).await.is_empty());
        assert_eq!(counters.calls.load(Ordering::SeqCst), 0);
    }
}
