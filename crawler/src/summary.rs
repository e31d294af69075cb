//! Statistics of a finished crawl.

use log::info;
use overlay_crawler_engine::{CrawlHandler, NetError, PeerInfo};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::time::Duration;

/// How a crawl ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlState {
    Succeeded,
    Cancelled,
}

impl fmt::Display for CrawlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrawlState::Succeeded => write!(f, "succeeded"),
            CrawlState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What a crawl found.
///
/// Histograms are sorted by descending count, ties by value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlSummary {
    pub state: CrawlState,
    pub crawled: usize,
    /// Crawled peers that could be connected to.
    pub dialable: usize,
    pub undialable: usize,
    /// Peers still queued when the crawl ended.
    pub remaining: usize,
    /// Connected peers whose routing table could not be fully fetched.
    pub crawl_errors: usize,
    pub connect_error_kinds: Vec<(NetError, usize)>,
    pub crawl_error_kinds: Vec<(NetError, usize)>,
    pub agents: Vec<(String, usize)>,
    pub protocols: Vec<(String, usize)>,
    pub duration: Duration,
}

impl CrawlSummary {
    pub fn from_handler<I: PeerInfo>(
        handler: &CrawlHandler<I>,
        state: CrawlState,
        remaining: usize,
        duration: Duration,
    ) -> Self {
        let undialable = handler.total_connect_errors();
        CrawlSummary {
            state,
            crawled: handler.crawled_peers,
            dialable: handler.crawled_peers.saturating_sub(undialable),
            undialable,
            remaining,
            crawl_errors: handler.total_errors(),
            connect_error_kinds: histogram(&handler.connect_errors),
            crawl_error_kinds: histogram(&handler.crawl_errors),
            agents: histogram(&handler.agent_versions),
            protocols: histogram(&handler.protocols),
            duration,
        }
    }

    /// Logs the summary at info level.
    pub fn log(&self) {
        info!("Crawl summary:");
        for (kind, count) in &self.connect_error_kinds {
            info!("  connect error {kind}: {count}");
        }
        for (kind, count) in &self.crawl_error_kinds {
            info!("  crawl error {kind}: {count}");
        }
        for (agent, count) in &self.agents {
            let agent = if agent.is_empty() { "<none>" } else { agent };
            info!("  agent {agent}: {count}");
        }
        for (protocol, count) in &self.protocols {
            info!("  protocol {protocol}: {count}");
        }
        info!(
            "Crawl {} in {:?}: {} crawled, {} dialable, {} undialable, {} remaining",
            self.state, self.duration, self.crawled, self.dialable, self.undialable, self.remaining
        );
    }
}

fn histogram<K: Clone + Ord + Hash>(counts: &HashMap<K, usize>) -> Vec<(K, usize)> {
    let mut entries: Vec<(K, usize)> = counts.iter().map(|(k, v)| (k.clone(), *v)).collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries
}
