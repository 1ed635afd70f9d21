//! Mapping wanted blocks onto store-gateway replicas.

use async_trait::async_trait;
use data_types::{BlockId, ReplicaAddr, TenantId};
use observability_deps::tracing::debug;
use ring::{fnv32a, InstanceDesc, Ring, RingView};
use snafu::{ensure, ResultExt, Snafu};
use std::{
    collections::{BTreeMap, HashMap},
    fmt::Debug,
    sync::Arc,
};
use store_client::{StoreClientError, StoreClientPool, StoreGatewayClient};

/// The replica-selection contract the fan-out coordinator depends on.
///
/// [`ReplicaSelector`] is the ring-backed implementation; tests script this
/// seam directly to pin block-to-replica assignments.
#[async_trait]
pub trait BlockReplicaSelection: Debug + Send + Sync + 'static {
    /// Assign every wanted block to one replica client, skipping the
    /// `(block, replica)` pairs listed in `exclude`.
    async fn clients_for(
        &self,
        tenant: &TenantId,
        blocks: &[BlockId],
        exclude: &HashMap<BlockId, Vec<ReplicaAddr>>,
        shard_size: usize,
    ) -> Result<Vec<(Arc<dyn StoreGatewayClient>, Vec<BlockId>)>, SelectionError>;
}

/// Errors mapping blocks to replicas.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum SelectionError {
    #[snafu(display(
        "no store-gateway replica left to try for blocks {}",
        join_ids(block_ids)
    ))]
    NoReplicasForBlocks { block_ids: Vec<BlockId> },

    #[snafu(display("cannot acquire client for store-gateway {}: {}", addr, source))]
    ClientUnavailable {
        addr: ReplicaAddr,
        source: StoreClientError,
    },
}

fn join_ids(ids: &[BlockId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Maps block IDs onto the replicas that should serve them.
///
/// Lookups run against the current ring snapshot (optionally reduced to the
/// tenant's shuffle shard). Each block is owned by the `replication_factor`
/// instances whose tokens cover its ID hash; among the owners not yet tried,
/// one is picked by highest-random-weight hashing, which spreads load across
/// owners yet is reproducible given the same ring. Assignments are grouped
/// per replica to keep the RPC count minimal.
#[derive(Debug)]
pub struct ReplicaSelector {
    ring_view: Arc<RingView>,
    pool: Arc<dyn StoreClientPool>,
    replication_factor: usize,
}

impl ReplicaSelector {
    /// Create a selector over `ring_view`, acquiring clients from `pool`.
    pub fn new(
        ring_view: Arc<RingView>,
        pool: Arc<dyn StoreClientPool>,
        replication_factor: usize,
    ) -> Self {
        Self {
            ring_view,
            pool,
            replication_factor,
        }
    }
}

#[async_trait]
impl BlockReplicaSelection for ReplicaSelector {
    /// Assign every wanted block to one replica, honoring `exclude`.
    ///
    /// `exclude` lists, per block, the replicas already tried in this
    /// request; they are never assigned the block again. Fails listing the
    /// offending blocks when no replica remains for any wanted block.
    async fn clients_for(
        &self,
        tenant: &TenantId,
        blocks: &[BlockId],
        exclude: &HashMap<BlockId, Vec<ReplicaAddr>>,
        shard_size: usize,
    ) -> Result<Vec<(Arc<dyn StoreGatewayClient>, Vec<BlockId>)>, SelectionError> {
        let full_ring = self.ring_view.snapshot();
        let shard_ring;
        let ring: &Ring = if shard_size > 0 {
            shard_ring = full_ring.shuffle_shard(tenant, shard_size);
            &shard_ring
        } else {
            &full_ring
        };

        let mut unassignable = vec![];
        let mut assignments: BTreeMap<ReplicaAddr, Vec<BlockId>> = BTreeMap::new();
        for block in blocks {
            let owners = ring.owners_for(block_token(block), self.replication_factor);
            let excluded = exclude.get(block);
            let eligible: Vec<&InstanceDesc> = owners
                .into_iter()
                .filter(|owner| {
                    !excluded
                        .map(|addrs| addrs.contains(&owner.addr))
                        .unwrap_or(false)
                })
                .collect();

            match pick_replica(block, &eligible) {
                Some(addr) => assignments.entry(addr).or_default().push(*block),
                None => unassignable.push(*block),
            }
        }
        ensure!(
            unassignable.is_empty(),
            NoReplicasForBlocksSnafu {
                block_ids: unassignable
            }
        );

        debug!(
            %tenant,
            n_blocks = blocks.len(),
            n_replicas = assignments.len(),
            "assigned blocks to store-gateway replicas"
        );

        let mut clients = Vec::with_capacity(assignments.len());
        for (addr, blocks) in assignments {
            let client = self
                .pool
                .client_for(&addr)
                .await
                .context(ClientUnavailableSnafu { addr: addr.clone() })?;
            clients.push((client, blocks));
        }
        Ok(clients)
    }
}

fn block_token(id: &BlockId) -> u32 {
    fnv32a(&id.as_u128().to_be_bytes())
}

/// Highest-random-weight choice among the eligible owners, replica address
/// as the tie-breaker.
fn pick_replica(block: &BlockId, eligible: &[&InstanceDesc]) -> Option<ReplicaAddr> {
    eligible
        .iter()
        .map(|instance| {
            let mut key = Vec::with_capacity(16 + instance.addr.as_str().len());
            key.extend_from_slice(&block.as_u128().to_be_bytes());
            key.extend_from_slice(instance.addr.as_str().as_bytes());
            (fnv32a(&key), &instance.addr)
        })
        .min_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)))
        .map(|(_, addr)| addr.clone())
}
