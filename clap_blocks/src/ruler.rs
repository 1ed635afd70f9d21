//! CLI config for the ruler.

use ruler::RulerConfig;
use std::time::Duration;

/// CLI config for the ruler's ownership loop.
#[derive(Debug, Clone, clap::Parser)]
pub struct RulerCliConfig {
    /// Interval of the periodic full rule group sync.
    #[clap(
        long = "--ruler-sync-interval",
        env = "TEPHRA_RULER_SYNC_INTERVAL",
        default_value = "1m",
        parse(try_from_str = humantime::parse_duration)
    )]
    pub sync_interval: Duration,

    /// How often to check the ring for membership changes.
    #[clap(
        long = "--ruler-ring-check-interval",
        env = "TEPHRA_RULER_RING_CHECK_INTERVAL",
        default_value = "5s",
        parse(try_from_str = humantime::parse_duration)
    )]
    pub ring_check_interval: Duration,

    /// Default ruler shuffle-shard size per tenant; 0 disables sharding.
    #[clap(
        long = "--ruler-tenant-shard-size",
        env = "TEPHRA_RULER_TENANT_SHARD_SIZE",
        default_value = "0",
        action
    )]
    pub tenant_shard_size: usize,
}

impl RulerCliConfig {
    /// Convert into the ruler's runtime config.
    pub fn ruler_config(&self) -> RulerConfig {
        RulerConfig {
            sync_interval: self.sync_interval,
            ring_check_interval: self.ring_check_interval,
        }
    }
}
