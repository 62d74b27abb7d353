//! Bundles every per-node dependency into one struct injected into HTTP
//! handlers and background loops, rather than file-scope globals. Each field
//! owns its own lock where one is needed; there is no single global lock
//! guarding the whole node.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::Config;
use crate::dedup::DedupSet;
use crate::election::Election;
use crate::membership_client::MembershipClient;
use crate::protos::ServerId;
use crate::storage::Storage;
use crate::tree::SpanningTree;

pub struct NodeContext {
    pub self_id: ServerId,
    pub config: Arc<Config>,
    pub election: Arc<Election>,
    pub tree: Arc<RwLock<SpanningTree>>,
    pub dedup: Arc<DedupSet>,
    pub storage: Arc<Storage>,
    pub membership: Arc<MembershipClient>,
    pub http: reqwest::Client,
    ready: AtomicBool,
}

impl NodeContext {
    pub fn new(config: Config) -> crate::errors::Result<Self> {
        let config = Arc::new(config);
        let membership = Arc::new(MembershipClient::new(&config.membership_host, config.http_timeout()));
        let election = Arc::new(Election::new(config.node_id, config.clone(), membership.clone()));
        let storage = Arc::new(Storage::open(&config.data_dir)?);
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| crate::errors::Error::FatalLocal(format!("failed to build http client: {e}")))?;

        Ok(NodeContext {
            self_id: config.node_id,
            dedup: Arc::new(DedupSet::new(config.dedup_ttl())),
            tree: Arc::new(RwLock::new(SpanningTree::new())),
            config,
            election,
            storage,
            membership,
            http,
            ready: AtomicBool::new(false),
        })
    }

    /// Flipped once after startup recovery finishes and membership
    /// registration succeeds; `/healthz` reports not-ready until then.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}
