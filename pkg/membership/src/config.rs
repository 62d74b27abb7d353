use std::time::Duration;

use clap::Parser;

/// Startup configuration for the membership registry, read once and never
/// consulted from the environment again afterwards.
#[derive(Debug, Clone, Parser)]
#[command(name = "membership-registry")]
pub struct Config {
    /// TCP port the registry's HTTP API listens on.
    #[arg(long, env = "MEMBERSHIP_HTTP_PORT", default_value_t = 7947)]
    pub http_port: u16,

    /// How long a lease remains valid after a register/keepalive, in milliseconds.
    #[arg(long, env = "LEASE_DURATION_MS", default_value_t = 6_000)]
    pub lease_duration_ms: u64,

    /// Interval between expiry sweeps, in milliseconds. Must be <= lease_duration_ms / 2.
    #[arg(long, env = "SWEEP_INTERVAL_MS", default_value_t = 3_000)]
    pub sweep_interval_ms: u64,
}

impl Config {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            http_port: 7947,
            lease_duration_ms: 6_000,
            sweep_interval_ms: 3_000,
        }
    }
}
