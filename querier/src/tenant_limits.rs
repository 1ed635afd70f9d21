//! Per-tenant limits consulted by the coordinator.

use data_types::TenantId;
use std::{fmt::Debug, time::Duration};

/// The per-tenant limits the coordinator reads.
///
/// Deployments back this with their runtime-reloadable overrides machinery;
/// the engine only ever reads through this trait.
pub trait TenantLimits: Debug + Send + Sync + 'static {
    /// Widest allowed time range of label-name/-value queries. `None`
    /// disables the clamp.
    fn max_labels_query_length(&self, tenant: &TenantId) -> Option<Duration>;

    /// Maximum chunks one query may fetch. `0` disables the limit.
    fn max_chunks_per_query(&self, tenant: &TenantId) -> u64;

    /// Size of the tenant's store-gateway shuffle shard. `0` disables
    /// sharding (the tenant uses the whole ring).
    fn store_gateway_tenant_shard_size(&self, tenant: &TenantId) -> usize;
}

/// [`TenantLimits`] returning the same values for every tenant.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedTenantLimits {
    /// See [`TenantLimits::max_labels_query_length`].
    pub max_labels_query_length: Option<Duration>,
    /// See [`TenantLimits::max_chunks_per_query`].
    pub max_chunks_per_query: u64,
    /// See [`TenantLimits::store_gateway_tenant_shard_size`].
    pub store_gateway_tenant_shard_size: usize,
}

impl TenantLimits for FixedTenantLimits {
    fn max_labels_query_length(&self, _tenant: &TenantId) -> Option<Duration> {
        self.max_labels_query_length
    }

    fn max_chunks_per_query(&self, _tenant: &TenantId) -> u64 {
        self.max_chunks_per_query
    }

    fn store_gateway_tenant_shard_size(&self, _tenant: &TenantId) -> usize {
        self.store_gateway_tenant_shard_size
    }
}
