//! CLI config for the query path.

use querier::{BlockStoreQuerierConfig, ConsistencyConfig, QueryLimits};
use std::time::Duration;

/// CLI config for the fan-out querier.
#[derive(Debug, Clone, clap::Parser)]
pub struct QuerierConfig {
    /// Number of selection/fan-out/consistency rounds before a query fails
    /// on missing blocks.
    #[clap(
        long = "--querier-max-attempts",
        env = "TEPHRA_QUERIER_MAX_ATTEMPTS",
        default_value = "3",
        action
    )]
    pub max_attempts: usize,

    /// Leave data newer than this to the write path; 0 disables the clamp.
    #[clap(
        long = "--querier-query-store-after",
        env = "TEPHRA_QUERIER_QUERY_STORE_AFTER",
        default_value = "0s",
        parse(try_from_str = humantime::parse_duration)
    )]
    pub query_store_after: Duration,

    /// Maximum distinct series per query; 0 disables the limit.
    #[clap(
        long = "--querier-max-series-per-query",
        env = "TEPHRA_QUERIER_MAX_SERIES_PER_QUERY",
        default_value = "0",
        action
    )]
    pub max_series_per_query: u64,

    /// Maximum total chunk bytes per query; 0 disables the limit.
    #[clap(
        long = "--querier-max-chunk-bytes-per-query",
        env = "TEPHRA_QUERIER_MAX_CHUNK_BYTES_PER_QUERY",
        default_value = "0",
        action
    )]
    pub max_chunk_bytes_per_query: u64,

    /// Maximum chunks per query; 0 disables the limit.
    #[clap(
        long = "--querier-max-chunks-per-query",
        env = "TEPHRA_QUERIER_MAX_CHUNKS_PER_QUERY",
        default_value = "0",
        action
    )]
    pub max_chunks_per_query: u64,

    /// How long after upload a block must at the latest be served by the
    /// store-gateways.
    #[clap(
        long = "--querier-consistency-delay",
        env = "TEPHRA_QUERIER_CONSISTENCY_DELAY",
        default_value = "30m",
        parse(try_from_str = humantime::parse_duration)
    )]
    pub consistency_delay: Duration,

    /// How long replicas keep serving blocks after their deletion mark.
    #[clap(
        long = "--querier-ignore-deletion-marks-delay",
        env = "TEPHRA_QUERIER_IGNORE_DELETION_MARKS_DELAY",
        default_value = "1h",
        parse(try_from_str = humantime::parse_duration)
    )]
    pub ignore_deletion_marks_delay: Duration,
}

impl QuerierConfig {
    /// Convert into the coordinator's runtime config.
    pub fn querier_config(&self) -> BlockStoreQuerierConfig {
        BlockStoreQuerierConfig {
            max_attempts: self.max_attempts,
            query_store_after: (!self.query_store_after.is_zero())
                .then_some(self.query_store_after),
            limits: QueryLimits {
                max_series: self.max_series_per_query,
                max_chunk_bytes: self.max_chunk_bytes_per_query,
                max_chunks: self.max_chunks_per_query,
            },
        }
    }

    /// Convert into the consistency checker's runtime config, given the
    /// catalog's sync interval.
    pub fn consistency_config(&self, sync_interval: Duration) -> ConsistencyConfig {
        ConsistencyConfig {
            consistency_delay: self.consistency_delay,
            sync_interval,
            ignore_deletion_marks_delay: self.ignore_deletion_marks_delay,
        }
    }
}
