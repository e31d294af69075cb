//! Routing table discovery by walking the common prefix length buckets.
//!
//! For each bucket `i` the walk asks the remote peer for the peers closest to
//! a random key that shares exactly `i` leading bits with the peer's own key.
//! The union of all answers approximates the remote routing table. Buckets
//! that could not be fetched are recorded as set bits in the table's error
//! bitmask, the answers of all other buckets are kept.

use crate::kademlia::Key;
use crate::transport::{FetchError, FindNode};
use log::{debug, warn};
use overlay_crawler_engine::{PeerInfo, RoutingTable};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// The most buckets a walk can cover, one bit of the error bitmask each.
pub const MAX_BUCKETS: usize = 16;

/// How bucket queries of a single walk are issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    /// One bucket after another, for transports without concurrent streams.
    Sequential,
    /// At most this many buckets at the same time.
    Parallel(usize),
}

#[derive(Debug, Clone)]
pub struct WalkConfig {
    /// Number of buckets to query, starting at bucket 0.
    pub buckets: usize,
    /// Attempts per bucket, the first one included.
    pub max_attempts: usize,
    /// Retry `n` of an overloaded or lost bucket waits `n` times this long.
    pub retry_backoff: Duration,
    pub concurrency: Concurrency,
}

impl Default for WalkConfig {
    fn default() -> Self {
        WalkConfig {
            buckets: MAX_BUCKETS,
            max_attempts: 2,
            retry_backoff: Duration::from_secs(5),
            concurrency: Concurrency::Sequential,
        }
    }
}

/// A bucket could not be fetched.
#[derive(Debug)]
pub struct BucketError {
    pub bucket: usize,
    pub source: FetchError,
}

impl fmt::Display for BucketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "getting closest peers with CPL {}: {}",
            self.bucket, self.source
        )
    }
}

impl Error for BucketError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}

/// Result of a walk.
#[derive(Debug)]
pub struct Walk<I: PeerInfo> {
    pub routing_table: RoutingTable<I>,
    /// When the first bucket query succeeded.
    pub first_response_at: Option<SystemTime>,
}

type BucketOutcome<I> = Result<(Vec<I>, SystemTime), BucketError>;

/// Walks the buckets of the peer with the given ID and key.
///
/// # Arguments
///
/// * `session` - Connection to the peer, shared by all bucket queries.
/// * `peer_id` - ID of the peer, stored in the routing table.
/// * `target` - Key of the peer, bucket keys are derived from it.
/// * `config` - Number of buckets, retry policy and concurrency.
/// * `cancel` - Aborts all outstanding bucket queries.
///
/// # Returns
///
/// The routing table with every distinct neighbor reported in any bucket. Its
/// error is the one of the lowest failed bucket.
pub async fn drain_buckets<I, S>(
    session: &Arc<S>,
    peer_id: I::Id,
    target: Key,
    config: &WalkConfig,
    cancel: &CancellationToken,
) -> Walk<I>
where
    I: PeerInfo,
    S: FindNode<I>,
{
    let buckets = config.buckets.min(MAX_BUCKETS);

    let mut outcomes: Vec<Option<BucketOutcome<I>>> = (0..buckets).map(|_| None).collect();
    match config.concurrency {
        Concurrency::Sequential => {
            for (bucket, slot) in outcomes.iter_mut().enumerate() {
                *slot = Some(fetch_bucket(session.as_ref(), target, bucket, config, cancel).await);
            }
        }
        Concurrency::Parallel(limit) => {
            let permits = Arc::new(Semaphore::new(limit.max(1)));
            let mut tasks = JoinSet::new();
            for bucket in 0..buckets {
                let session = session.clone();
                let permits = permits.clone();
                let config = config.clone();
                let cancel = cancel.clone();
                tasks.spawn(async move {
                    // The semaphore is never closed.
                    let _permit = permits.acquire_owned().await.ok();
                    let outcome = fetch_bucket(session.as_ref(), target, bucket, &config, &cancel).await;
                    (bucket, outcome)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((bucket, outcome)) => outcomes[bucket] = Some(outcome),
                    Err(err) => warn!("Bucket query task failed: {err}"),
                }
            }
        }
    }

    let mut table = RoutingTable::new(peer_id);
    table.buckets = buckets;
    let mut first_response_at: Option<SystemTime> = None;
    let mut neighbors: HashMap<I::Id, I> = HashMap::new();

    for (bucket, outcome) in outcomes.into_iter().enumerate() {
        let outcome = outcome.unwrap_or_else(|| {
            Err(BucketError {
                bucket,
                source: FetchError::Failed("bucket query aborted".into()),
            })
        });

        match outcome {
            Ok((peers, at)) => {
                first_response_at = Some(first_response_at.map_or(at, |first| first.min(at)));
                for peer in peers {
                    neighbors.insert(peer.id().clone(), peer);
                }
            }
            Err(err) => {
                debug!("Bucket {bucket} of {} failed: {err}", table.peer_id);
                table.error_bits |= 1 << bucket;
                if table.error.is_none() {
                    table.error = Some(Arc::new(err));
                }
            }
        }
    }

    table.neighbors = neighbors.into_values().collect();
    Walk {
        routing_table: table,
        first_response_at,
    }
}

async fn fetch_bucket<I, S>(
    session: &S,
    target: Key,
    bucket: usize,
    config: &WalkConfig,
    cancel: &CancellationToken,
) -> BucketOutcome<I>
where
    S: FindNode<I>,
{
    let fail = |source| BucketError { bucket, source };

    let key = target
        .random_with_cpl(bucket)
        .ok_or_else(|| fail(FetchError::Failed("bucket outside of keyspace".into())))?;

    let mut attempt = 0;
    loop {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            fetched = session.find_node(key) => fetched,
        };

        let err = match fetched {
            Ok(peers) => return Ok((peers, SystemTime::now())),
            Err(err) => err,
        };

        attempt += 1;
        let retryable = matches!(err, FetchError::Overloaded | FetchError::ConnectionLost);
        if !retryable || attempt >= config.max_attempts {
            return Err(fail(err));
        }

        let wait = config.retry_backoff * attempt as u32;
        debug!("Retrying bucket {bucket} in {wait:?} after: {err}");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(fail(FetchError::Cancelled)),
            _ = tokio::time::sleep(wait) => {}
        }

        if matches!(err, FetchError::ConnectionLost) {
            session.reconnect().await.map_err(fail)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeId, NodeRecord};
    use rand::Rng;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Plays back a scripted sequence of responses per bucket.
    struct ScriptedSession {
        target: Key,
        scripts: Mutex<HashMap<usize, Vec<Result<Vec<NodeRecord>, FetchError>>>>,
        queries: AtomicUsize,
        reconnects: AtomicUsize,
        fail_reconnect: bool,
    }

    impl ScriptedSession {
        fn new(target: Key) -> Self {
            ScriptedSession {
                target,
                scripts: Mutex::new(HashMap::new()),
                queries: AtomicUsize::new(0),
                reconnects: AtomicUsize::new(0),
                fail_reconnect: false,
            }
        }

        /// Responses are played back in order, later queries repeat the last one.
        fn script(self, bucket: usize, responses: Vec<Result<Vec<NodeRecord>, FetchError>>) -> Self {
            self.scripts.lock().unwrap().insert(bucket, responses);
            self
        }
    }

    impl FindNode<NodeRecord> for ScriptedSession {
        async fn find_node(&self, key: Key) -> Result<Vec<NodeRecord>, FetchError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            let bucket = self.target.common_prefix_len(&key);

            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(&bucket) {
                Some(responses) if responses.len() > 1 => responses.remove(0),
                Some(responses) => match responses.first() {
                    Some(Ok(peers)) => Ok(peers.clone()),
                    Some(Err(FetchError::Overloaded)) => Err(FetchError::Overloaded),
                    Some(Err(FetchError::ConnectionLost)) => Err(FetchError::ConnectionLost),
                    Some(Err(err)) => Err(FetchError::Failed(err.to_string().into())),
                    None => Ok(Vec::new()),
                },
                None => Ok(Vec::new()),
            }
        }

        async fn reconnect(&self) -> Result<(), FetchError> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            if self.fail_reconnect {
                return Err(FetchError::Failed("connection refused".into()));
            }
            Ok(())
        }
    }

    fn fast() -> WalkConfig {
        WalkConfig {
            retry_backoff: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn node(last: u8) -> NodeRecord {
        let mut bytes = [0u8; 32];
        bytes[31] = last;
        NodeRecord::new(
            NodeId::new(bytes),
            vec![SocketAddr::from(([10, 0, 0, last], 30303))],
        )
    }

    fn ids(table: &RoutingTable<NodeRecord>) -> Vec<u8> {
        let mut ids: Vec<u8> = table.neighbors.iter().map(|n| n.id().as_bytes()[31]).collect();
        ids.sort();
        ids
    }

    async fn walk(session: ScriptedSession, config: &WalkConfig) -> (Walk<NodeRecord>, Arc<ScriptedSession>) {
        let target = session.target;
        let session = Arc::new(session);
        let walk = drain_buckets(
            &session,
            NodeId::from(target),
            target,
            config,
            &CancellationToken::new(),
        )
        .await;
        (walk, session)
    }

    #[tokio::test]
    async fn test_all_buckets_succeed() {
        let target = Key::random();
        let session = ScriptedSession::new(target)
            .script(0, vec![Ok(vec![node(1), node(2)])])
            .script(7, vec![Ok(vec![node(2), node(3)])]);

        let (walk, session) = walk(session, &fast()).await;
        let table = walk.routing_table;

        assert_eq!(table.error_bits, 0);
        assert!(table.error.is_none());
        assert_eq!(ids(&table), vec![1, 2, 3]);
        assert!(walk.first_response_at.is_some());
        assert_eq!(session.queries.load(Ordering::SeqCst), MAX_BUCKETS);
    }

    #[tokio::test]
    async fn test_error_bits_match_failed_buckets() {
        let mut rng = rand::thread_rng();

        for round in 0..20 {
            let pattern: u16 = rng.gen();
            let parallel = round % 2 == 1;
            let target = Key::random();

            let mut session = ScriptedSession::new(target);
            let mut expected = Vec::new();
            for bucket in 0..MAX_BUCKETS {
                if pattern & (1 << bucket) != 0 {
                    session = session.script(bucket, vec![Err(FetchError::Failed("stream reset".into()))]);
                } else {
                    session = session.script(bucket, vec![Ok(vec![node(bucket as u8)])]);
                    expected.push(bucket as u8);
                }
            }

            let config = WalkConfig {
                concurrency: if parallel {
                    Concurrency::Parallel(4)
                } else {
                    Concurrency::Sequential
                },
                ..fast()
            };
            let (walk, _) = walk(session, &config).await;
            let table = walk.routing_table;

            assert_eq!(table.error_bits, pattern, "round {round}");
            assert_eq!(ids(&table), expected, "round {round}");
            assert_eq!(table.error.is_some(), pattern != 0);
            assert_eq!(table.all_failed(), pattern == u16::MAX);
            assert_eq!(walk.first_response_at.is_some(), pattern != u16::MAX);
        }
    }

    #[tokio::test]
    async fn test_first_failed_bucket_is_recorded() {
        let target = Key::random();
        let session = ScriptedSession::new(target)
            .script(3, vec![Err(FetchError::Failed("protocol not supported".into()))])
            .script(9, vec![Err(FetchError::Failed("stream reset".into()))]);

        let config = WalkConfig {
            concurrency: Concurrency::Parallel(16),
            ..fast()
        };
        let (walk, _) = walk(session, &config).await;
        let table = walk.routing_table;

        assert_eq!(table.error_bits, (1 << 3) | (1 << 9));
        let err = table.error.unwrap().to_string();
        assert_eq!(err, "getting closest peers with CPL 3: protocol not supported");
    }

    #[tokio::test]
    async fn test_overloaded_bucket_is_retried() {
        let target = Key::random();
        let session = ScriptedSession::new(target)
            .script(0, vec![Err(FetchError::Overloaded), Ok(vec![node(1)])])
            .script(1, vec![Err(FetchError::Overloaded)]);

        let (walk, session) = walk(session, &fast()).await;
        let table = walk.routing_table;

        // Bucket 0 recovers on its second attempt, bucket 1 never does.
        assert_eq!(table.error_bits, 0b10);
        assert_eq!(ids(&table), vec![1]);
        assert_eq!(session.queries.load(Ordering::SeqCst), MAX_BUCKETS + 2);
        assert_eq!(session.reconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_lost_connection_reconnects() {
        let target = Key::random();
        let session = ScriptedSession::new(target)
            .script(5, vec![Err(FetchError::ConnectionLost), Ok(vec![node(5)])]);

        let (walk, session) = walk(session, &fast()).await;

        assert_eq!(walk.routing_table.error_bits, 0);
        assert_eq!(ids(&walk.routing_table), vec![5]);
        assert_eq!(session.reconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_reconnect_fails_bucket() {
        let target = Key::random();
        let mut session = ScriptedSession::new(target)
            .script(2, vec![Err(FetchError::ConnectionLost), Ok(vec![node(2)])]);
        session.fail_reconnect = true;

        let (walk, _) = walk(session, &fast()).await;

        assert_eq!(walk.routing_table.error_bits, 1 << 2);
        assert!(walk.routing_table.neighbors.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_walk_fails_all_buckets() {
        let target = Key::random();
        let session = Arc::new(ScriptedSession::new(target));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let walk: Walk<NodeRecord> = drain_buckets(
            &session,
            NodeId::from(target),
            target,
            &fast(),
            &cancel,
        )
        .await;

        assert!(walk.routing_table.all_failed());
        assert!(walk.first_response_at.is_none());
    }

    #[tokio::test]
    async fn test_fewer_buckets() {
        let target = Key::random();
        let session = ScriptedSession::new(target).script(4, vec![Ok(vec![node(4)])]);

        let config = WalkConfig {
            buckets: 4,
            ..fast()
        };
        let (walk, session) = walk(session, &config).await;

        assert!(walk.routing_table.neighbors.is_empty());
        assert_eq!(session.queries.load(Ordering::SeqCst), 4);
        assert_eq!(walk.routing_table.buckets, 4);
        assert!(!walk.routing_table.all_failed());
    }

    #[tokio::test]
    async fn test_all_of_fewer_buckets_failed() {
        let target = Key::random();
        let mut session = ScriptedSession::new(target);
        for bucket in 0..4 {
            session = session.script(bucket, vec![Err(FetchError::Failed("stream reset".into()))]);
        }

        let config = WalkConfig {
            buckets: 4,
            ..fast()
        };
        let (walk, _) = walk(session, &config).await;

        assert_eq!(walk.routing_table.error_bits, 0b1111);
        assert_eq!(walk.routing_table.failed_buckets(), 4);
        assert!(walk.routing_table.all_failed());
        assert_eq!(walk.first_response_at, None);
    }
}
