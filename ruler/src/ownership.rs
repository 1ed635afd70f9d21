//! The ring-based ownership rule.

use crate::{RuleGroupKey, RulerLimits};
use data_types::ReplicaAddr;
use ring::{fnv32a, Ring};

/// The ring token of a rule group: `fnv32a(tenant "/" namespace "/" name)`.
pub fn group_token(key: &RuleGroupKey) -> u32 {
    let mut data = Vec::with_capacity(
        key.tenant.as_str().len() + key.namespace.len() + key.name.len() + 2,
    );
    data.extend_from_slice(key.tenant.as_str().as_bytes());
    data.push(b'/');
    data.extend_from_slice(key.namespace.as_bytes());
    data.push(b'/');
    data.extend_from_slice(key.name.as_bytes());
    fnv32a(&data)
}

/// Whether the replica at `self_addr` owns `key` under `ring`.
///
/// A group is owned iff the primary owner of its token is this replica. With
/// a tenant shard size configured, ownership resolves against the tenant's
/// shuffle-shard sub-ring instead of the full ring.
pub fn owns_group(
    ring: &Ring,
    key: &RuleGroupKey,
    self_addr: &ReplicaAddr,
    limits: &dyn RulerLimits,
) -> bool {
    let shard_size = limits.ruler_tenant_shard_size(&key.tenant);
    let sub_ring;
    let ring = if shard_size > 0 {
        sub_ring = ring.shuffle_shard(&key.tenant, shard_size);
        &sub_ring
    } else {
        ring
    };

    ring.primary_for(group_token(key))
        .map(|primary| &primary.addr == self_addr)
        .unwrap_or(false)
}
