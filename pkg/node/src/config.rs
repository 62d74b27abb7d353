use std::time::Duration;

use clap::Parser;

/// Startup configuration for a single replica, parsed once. Every timer the
/// node uses is a field here rather than a hardcoded constant so integration
/// tests can compress them instead of sleeping on real wall-clock durations.
#[derive(Debug, Clone, Parser)]
#[command(name = "node")]
pub struct Config {
    /// This replica's small positive integer id (1..N).
    #[arg(long, env = "NODE_ID")]
    pub node_id: u64,

    /// host:port of the membership registry.
    #[arg(long, env = "MEMBERSHIP_HOST")]
    pub membership_host: String,

    /// Address this node advertises to the registry and to peers.
    #[arg(long, env = "ADVERTISE_ADDR")]
    pub advertise_addr: String,

    /// Port the per-node HTTP API listens on.
    #[arg(long, env = "HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,

    /// Base port for the vote/heartbeat TCP listener; actual port is base + node_id.
    #[arg(long, env = "TCP_PORT_BASE", default_value_t = 8000)]
    pub tcp_port_base: u16,

    /// Directory holding this node's sqlite-backed log and state store.
    #[arg(long, env = "NODE_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    #[arg(long, env = "HEARTBEAT_INTERVAL_MS", default_value_t = 2_000)]
    pub heartbeat_interval_ms: u64,

    #[arg(long, env = "LEADER_TIMEOUT_MS", default_value_t = 4_000)]
    pub leader_timeout_ms: u64,

    #[arg(long, env = "ELECTION_JITTER_MIN_MS", default_value_t = 150)]
    pub election_jitter_min_ms: u64,

    #[arg(long, env = "ELECTION_JITTER_MAX_MS", default_value_t = 300)]
    pub election_jitter_max_ms: u64,

    #[arg(long, env = "ELECTION_WINDOW_MS", default_value_t = 2_000)]
    pub election_window_ms: u64,

    #[arg(long, env = "MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    #[arg(long, env = "RETRY_BACKOFF_MS", default_value_t = 500)]
    pub retry_backoff_ms: u64,

    #[arg(long, env = "HTTP_TIMEOUT_MS", default_value_t = 5_000)]
    pub http_timeout_ms: u64,

    #[arg(long, env = "MULTICAST_TIMEOUT_MS", default_value_t = 10_000)]
    pub multicast_timeout_ms: u64,

    #[arg(long, env = "DEDUP_TTL_MS", default_value_t = 300_000)]
    pub dedup_ttl_ms: u64,

    #[arg(long, env = "LEASE_DURATION_MS", default_value_t = 6_000)]
    pub lease_duration_ms: u64,
}

impl Config {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
    pub fn leader_timeout(&self) -> Duration {
        Duration::from_millis(self.leader_timeout_ms)
    }
    pub fn election_jitter(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.election_jitter_min_ms),
            Duration::from_millis(self.election_jitter_max_ms),
        )
    }
    pub fn election_window(&self) -> Duration {
        Duration::from_millis(self.election_window_ms)
    }
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
    pub fn multicast_timeout(&self) -> Duration {
        Duration::from_millis(self.multicast_timeout_ms)
    }
    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_millis(self.dedup_ttl_ms)
    }
    pub fn tcp_port(&self) -> u16 {
        self.tcp_port_base + self.node_id as u16
    }

    /// Rejects a `membership_host`/`advertise_addr` that doesn't parse as
    /// `host:port`, fatal at startup rather than surfacing as a confusing
    /// connection failure deep in some later loop.
    pub fn validate(&self) -> crate::errors::Result<()> {
        for (name, value) in [("MEMBERSHIP_HOST", &self.membership_host), ("ADVERTISE_ADDR", &self.advertise_addr)] {
            match value.rsplit_once(':') {
                Some((_, port)) if port.parse::<u16>().is_ok() => {}
                _ => return Err(crate::errors::Error::FatalLocal(format!("{name} {value:?} is not a valid host:port"))),
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn for_test(node_id: u64) -> Self {
        Config {
            node_id,
            membership_host: "127.0.0.1:0".into(),
            advertise_addr: format!("127.0.0.1:{}", 9000 + node_id),
            http_port: 0,
            tcp_port_base: 8000,
            data_dir: "./data".into(),
            heartbeat_interval_ms: 20,
            leader_timeout_ms: 40,
            election_jitter_min_ms: 1,
            election_jitter_max_ms: 3,
            election_window_ms: 20,
            max_retries: 3,
            retry_backoff_ms: 5,
            http_timeout_ms: 50,
            multicast_timeout_ms: 100,
            dedup_ttl_ms: 5_000,
            lease_duration_ms: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_test_config_is_valid() {
        Config::for_test(1).validate().unwrap();
    }

    #[test]
    fn rejects_address_without_port() {
        let mut config = Config::for_test(1);
        config.membership_host = "localhost".into();
        assert!(config.validate().is_err());
    }
}
