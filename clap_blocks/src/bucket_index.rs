//! CLI config for the block catalog.

use bucket_index::PullConfig;
use std::time::Duration;

/// CLI config for the pull-variant bucket index reader.
#[derive(Debug, Clone, clap::Parser)]
pub struct BucketIndexConfig {
    /// How often to re-read a tenant's bucket index object.
    #[clap(
        long = "--bucket-index-sync-interval",
        env = "TEPHRA_BUCKET_INDEX_SYNC_INTERVAL",
        default_value = "15m",
        parse(try_from_str = humantime::parse_duration)
    )]
    pub sync_interval: Duration,

    /// Refuse to serve queries from an index older than this.
    #[clap(
        long = "--bucket-index-max-stale-period",
        env = "TEPHRA_BUCKET_INDEX_MAX_STALE_PERIOD",
        default_value = "1h",
        parse(try_from_str = humantime::parse_duration)
    )]
    pub max_stale_period: Duration,

    /// Evict cached indexes of tenants idle for longer than this.
    #[clap(
        long = "--bucket-index-idle-timeout",
        env = "TEPHRA_BUCKET_INDEX_IDLE_TIMEOUT",
        default_value = "1h",
        parse(try_from_str = humantime::parse_duration)
    )]
    pub idle_timeout: Duration,
}

impl BucketIndexConfig {
    /// Convert into the finder's runtime config.
    pub fn pull_config(&self) -> PullConfig {
        PullConfig {
            sync_interval: self.sync_interval,
            max_stale_period: self.max_stale_period,
            idle_timeout: self.idle_timeout,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn defaults() {
        let config = BucketIndexConfig::try_parse_from(["test"]).unwrap();
        assert_eq!(config.sync_interval, Duration::from_secs(15 * 60));
        assert_eq!(config.max_stale_period, Duration::from_secs(3600));
        assert_eq!(config.pull_config().idle_timeout, Duration::from_secs(3600));
    }

    #[test]
    fn humantime_flags() {
        let config = BucketIndexConfig::try_parse_from([
            "test",
            "--bucket-index-sync-interval",
            "90s",
            "--bucket-index-max-stale-period",
            "2h",
        ])
        .unwrap();
        assert_eq!(config.sync_interval, Duration::from_secs(90));
        assert_eq!(config.max_stale_period, Duration::from_secs(7200));
    }

    #[test]
    fn garbage_duration_is_rejected() {
        assert!(
            BucketIndexConfig::try_parse_from(["test", "--bucket-index-sync-interval", "soon"])
                .is_err()
        );
    }
}
