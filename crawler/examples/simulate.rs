//! Crawl a simulated overlay network held in memory.

use clap::Parser;
use log::LevelFilter;
use overlay_crawler::{
    BoxError, Concurrency, CrawlerBuilder, Dialer, FetchError, FindNode, Identity, KadPeer, Key,
    MemoryStore, NodeId, NodeRecord, PeerInfo, Session,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Most peers a node returns per query.
const REPLICATION: usize = 20;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of nodes in the network.
    #[arg(short, long, default_value = "500")]
    nodes: usize,

    /// Number of other nodes every node knows.
    #[arg(short, long, default_value = "30")]
    degree: usize,

    /// Number of nodes that never answer.
    #[arg(long, default_value = "50")]
    offline: usize,

    /// Number of nodes only reachable on private addresses.
    #[arg(long, default_value = "20")]
    private: usize,

    /// Maximum simulated latency of a single query in milliseconds.
    #[arg(long, default_value = "10")]
    latency_ms: u64,

    /// Number of concurrent crawl workers.
    #[arg(short, long, default_value = "16")]
    workers: usize,

    /// Stop after this many peers, 0 for no limit.
    #[arg(long, default_value = "0")]
    limit: usize,

    /// Fetch up to this many buckets of a peer at the same time.
    #[arg(long)]
    parallel_buckets: Option<usize>,

    /// Seed of the simulated topology.
    #[arg(long)]
    seed: Option<u64>,

    /// Log level.
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

struct SimNode {
    record: NodeRecord,
    neighbors: Vec<NodeRecord>,
    online: bool,
    private: bool,
    agent: &'static str,
}

struct SimDialer {
    nodes: HashMap<NodeId, SimNode>,
    latency_ms: u64,
}

impl SimDialer {
    fn generate(args: &Args) -> Self {
        let mut rng = match args.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let records: Vec<NodeRecord> = (0..args.nodes)
            .map(|i| {
                let mut id = [0u8; 32];
                rng.fill(&mut id);
                let [_, _, hi, lo] = (i as u32).to_be_bytes();
                let addr = if i < args.private {
                    SocketAddr::from(([192, 168, hi, lo], 4001))
                } else {
                    SocketAddr::from(([8 + (i % 2) as u8, 0, hi, lo], 4001))
                };
                NodeRecord::new(NodeId::new(id), vec![addr])
            })
            .collect();

        let agents = ["kad-node/0.30.0", "kad-node/0.29.1", "kad-lite/1.2.0"];
        let mut nodes = HashMap::new();
        for (i, record) in records.iter().enumerate() {
            let neighbors = records
                .choose_multiple(&mut rng, args.degree + 1)
                .filter(|n| n.id() != record.id())
                .take(args.degree)
                .cloned()
                .collect();
            let node = SimNode {
                record: record.clone(),
                neighbors,
                online: i < args.nodes.saturating_sub(args.offline),
                private: i < args.private,
                agent: agents[rng.gen_range(0..agents.len())],
            };
            nodes.insert(*record.id(), node);
        }
        SimDialer {
            nodes,
            latency_ms: args.latency_ms,
        }
    }

    fn bootstrap(&self) -> Vec<NodeRecord> {
        let mut online: Vec<NodeRecord> = self
            .nodes
            .values()
            .filter(|n| n.online && !n.private)
            .map(|n| n.record.clone())
            .collect();
        online.sort_by_key(|n| *n.id());
        online.truncate(3);
        online
    }
}

struct SimSession {
    neighbors: Vec<NodeRecord>,
    agent: &'static str,
    listen_addrs: Vec<SocketAddr>,
    latency_ms: u64,
}

impl FindNode<NodeRecord> for SimSession {
    async fn find_node(&self, target: Key) -> Result<Vec<NodeRecord>, FetchError> {
        let latency = rand::thread_rng().gen_range(0..=self.latency_ms);
        tokio::time::sleep(Duration::from_millis(latency)).await;

        let mut closest = self.neighbors.clone();
        closest.sort_by_key(|n| n.kad_key().distance(&target));
        closest.truncate(REPLICATION);
        Ok(closest)
    }

    async fn reconnect(&self) -> Result<(), FetchError> {
        Ok(())
    }
}

impl Session<NodeRecord> for SimSession {
    async fn identify(&self) -> Result<Identity, BoxError> {
        Ok(Identity {
            agent: Some(self.agent.to_string()),
            protocols: vec!["/kad/1.0.0".to_string(), "/id/1.0.0".to_string()],
            listen_addrs: self.listen_addrs.clone(),
        })
    }

    async fn close(&self) {}
}

impl Dialer for SimDialer {
    type Peer = NodeRecord;
    type Session = SimSession;

    async fn dial(&self, peer: &NodeRecord, _addrs: &[SocketAddr]) -> Result<SimSession, BoxError> {
        match self.nodes.get(peer.id()) {
            Some(node) if node.online => Ok(SimSession {
                neighbors: node.neighbors.clone(),
                agent: node.agent,
                listen_addrs: node.record.addrs().to_vec(),
                latency_ms: self.latency_ms,
            }),
            Some(_) => Err("dial tcp: i/o timeout".into()),
            None => Err("no good addresses".into()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    // Configure fern logger
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}] {} - {}",
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log_level)
        .chain(std::io::stderr())
        .apply()?;

    log::info!(
        "CRAWLING A SIMULATED NETWORK OF {} NODES ({} offline, {} private)",
        args.nodes,
        args.offline,
        args.private
    );

    let dialer = SimDialer::generate(&args);
    let bootstrap = dialer.bootstrap();
    if bootstrap.is_empty() {
        return Err("No online node with a public address to start from".into());
    }

    let concurrency = match args.parallel_buckets {
        Some(n) => Concurrency::Parallel(n),
        None => Concurrency::Sequential,
    };
    log::debug!("Fetching buckets {concurrency:?}");

    let crawler = CrawlerBuilder::new(dialer)
        .with_worker_count(args.workers)
        .with_limit(args.limit)
        .with_walk_concurrency(concurrency)
        .with_track_neighbors(true)
        .with_status_interval(Duration::from_secs(1))
        .build()?;

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Received interrupt, stopping crawl");
            stopper.cancel();
        }
    });

    let store = Arc::new(MemoryStore::new());
    let summary = crawler.crawl(bootstrap, store.clone(), cancel).await?;

    log::info!(
        "Stored {} visits and {} neighbor records",
        store.visits().await.len(),
        store.neighbors().await.len()
    );
    log::info!(
        "Crawl {}: {} of {} nodes crawled",
        summary.state,
        summary.crawled,
        args.nodes
    );

    Ok(())
}
