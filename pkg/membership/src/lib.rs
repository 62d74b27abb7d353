//! Single-process registry tracking {node id -> address, lease expiry, leader flag}.
//!
//! This is component A of the replication control plane: every node
//! heartbeats to it, the election module (component B, in the `node` crate)
//! polls it for the active set, and the spanning-tree builder (component C)
//! rebuilds from its snapshots. The registry itself does not know about
//! terms or elections — `is_leader` is advisory, set by whichever node last
//! claimed it (see `claim_leader`).

pub mod config;
pub mod errors;
pub mod http;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::types::MembershipEntry;

fn validate_address(address: &str) -> Result<()> {
    match address.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(Error::InvalidAddress(address.to_string())),
    }
}

#[derive(Clone)]
pub struct Registry {
    inner: Arc<RwLock<HashMap<u64, MembershipEntry>>>,
    lease_duration: std::time::Duration,
}

impl Registry {
    pub fn new(config: &Config) -> Self {
        Registry {
            inner: Arc::new(RwLock::new(HashMap::new())),
            lease_duration: config.lease_duration(),
        }
    }

    /// A duplicate register just refreshes the existing entry's lease and
    /// address rather than erroring.
    pub async fn register(&self, id: u64, address: String) -> Result<String> {
        validate_address(&address)?;

        let lease_id = Uuid::new_v4().to_string();
        let expires_at = Utc::now() + self.lease_duration;

        let mut entries = self.inner.write().await;
        let is_leader = entries.get(&id).map(|e| e.is_leader).unwrap_or(false);

        entries.insert(
            id,
            MembershipEntry {
                id,
                address,
                lease_id: lease_id.clone(),
                expires_at,
                is_leader,
            },
        );

        info!(node_id = id, "registered");
        Ok(lease_id)
    }

    /// A keepalive for an unknown id implicitly registers it: the contract is
    /// that a correctly-behaving node registers first, but we don't want a
    /// lost register response to wedge a node out of the cluster forever.
    pub async fn keepalive(&self, id: u64, address: String, is_leader: bool) -> Result<()> {
        validate_address(&address)?;

        let expires_at = Utc::now() + self.lease_duration;
        let mut entries = self.inner.write().await;

        if is_leader {
            // Exactly one node may hold is_leader=true at a time. The registry
            // is not the authority on who should be leader -- the election
            // loop decides that -- but it does enforce the single-holder
            // invariant here.
            for (other_id, entry) in entries.iter_mut() {
                if *other_id != id {
                    entry.is_leader = false;
                }
            }
        }

        match entries.get_mut(&id) {
            Some(entry) => {
                entry.address = address;
                entry.expires_at = expires_at;
                entry.is_leader = is_leader;
            }
            None => {
                entries.insert(
                    id,
                    MembershipEntry {
                        id,
                        address,
                        lease_id: Uuid::new_v4().to_string(),
                        expires_at,
                        is_leader,
                    },
                );
            }
        }

        Ok(())
    }

    pub async fn members(&self) -> HashMap<u64, MembershipEntry> {
        self.inner.read().await.clone()
    }

    pub async fn leader(&self) -> Option<MembershipEntry> {
        let now = Utc::now();
        self.inner
            .read()
            .await
            .values()
            .find(|e| e.is_leader && !e.is_expired(now))
            .cloned()
    }

    /// Removes any entry whose lease has elapsed. Run on an interval <=
    /// lease_duration / 2.
    async fn sweep(&self) {
        let now = Utc::now();
        let mut entries = self.inner.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "swept expired membership entries");
        }
    }

    /// Spawns the background sweeper. The returned handle is not normally
    /// awaited; it runs for the lifetime of the process.
    pub fn spawn_sweeper(self: Arc<Self>, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            http_port: 0,
            lease_duration_ms: 50,
            sweep_interval_ms: 25,
        }
    }

    #[tokio::test]
    async fn register_then_keepalive_refreshes_lease() {
        let reg = Registry::new(&test_config());
        let lease = reg.register(1, "127.0.0.1:9001".into()).await.unwrap();
        assert!(!lease.is_empty());

        reg.keepalive(1, "127.0.0.1:9001".into(), false).await.unwrap();
        let members = reg.members().await;
        assert_eq!(members.len(), 1);
        assert_eq!(members[&1].address, "127.0.0.1:9001");
    }

    #[tokio::test]
    async fn keepalive_on_unknown_id_implicitly_registers() {
        let reg = Registry::new(&test_config());
        reg.keepalive(3, "127.0.0.1:9003".into(), false).await.unwrap();
        assert!(reg.members().await.contains_key(&3));
    }

    #[tokio::test]
    async fn only_one_leader_at_a_time() {
        let reg = Registry::new(&test_config());
        reg.register(1, "127.0.0.1:9001".into()).await.unwrap();
        reg.register(2, "127.0.0.1:9002".into()).await.unwrap();

        reg.keepalive(1, "127.0.0.1:9001".into(), true).await.unwrap();
        assert_eq!(reg.leader().await.unwrap().id, 1);

        reg.keepalive(2, "127.0.0.1:9002".into(), true).await.unwrap();
        let members = reg.members().await;
        assert!(!members[&1].is_leader);
        assert!(members[&2].is_leader);
        assert_eq!(reg.leader().await.unwrap().id, 2);
    }

    #[tokio::test]
    async fn register_rejects_malformed_address() {
        let reg = Registry::new(&test_config());
        assert!(reg.register(1, "not-a-host-port".into()).await.is_err());
        assert!(reg.members().await.is_empty());
    }

    #[tokio::test]
    async fn expired_entries_are_swept() {
        let reg = Registry::new(&test_config());
        reg.register(1, "127.0.0.1:9001".into()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        reg.sweep().await;
        assert!(reg.members().await.is_empty());
    }
}
