//! Query-path metrics.

use metric::{Attributes, U64Counter, U64Histogram};

/// Counters and distributions recorded by the fan-out coordinator.
#[derive(Debug)]
pub struct QuerierMetrics {
    /// Distinct store-gateway replicas that served data, per query.
    pub stores_hit: U64Histogram,
    /// Consistency-driven refetch rounds, per query (`final attempt - 1`).
    pub refetches: U64Histogram,
    /// Queries that exhausted their attempts with blocks still missing.
    pub consistency_check_failures: U64Counter,
    /// Blocks kept despite an incompatible compactor/query shard pairing.
    pub shard_incompatible_blocks: U64Counter,
}

impl QuerierMetrics {
    /// Register all query-path instruments in `registry`.
    pub fn new(registry: &metric::Registry) -> Self {
        Self {
            stores_hit: registry
                .register_metric::<U64Histogram>(
                    "querier_store_gateway_instances_hit_per_query",
                    "number of store-gateway replicas that served data for a query",
                )
                .recorder(Attributes::default()),
            refetches: registry
                .register_metric::<U64Histogram>(
                    "querier_store_gateway_refetches_per_query",
                    "number of consistency-driven refetch rounds per query",
                )
                .recorder(Attributes::default()),
            consistency_check_failures: registry
                .register_metric::<U64Counter>(
                    "querier_blocks_consistency_check_failures",
                    "queries failed because expected blocks were never queried",
                )
                .recorder(Attributes::default()),
            shard_incompatible_blocks: registry
                .register_metric::<U64Counter>(
                    "querier_shard_filter_incompatible_blocks",
                    "blocks kept because compactor and query shard counts were incompatible",
                )
                .recorder(Attributes::default()),
        }
    }
}
