//! Block catalogs: who knows which blocks exist for a tenant.
//!
//! Two implementations share the [`BlockFinder`] contract. The *pull* variant
//! ([`BucketIndexBlockFinder`]) reads a single per-tenant index object that an
//! external producer refreshes periodically; the *scan* variant
//! ([`ScanBlockFinder`]) enumerates per-block meta objects directly. Both
//! return blocks sorted by max time descending together with the tenant's
//! deletion marks for those blocks.
//!
//! The catalog is eventually consistent. Callers must not trust a catalog
//! beyond `max_stale_period`; past that bound [`BlockFinderError::IndexStale`]
//! is returned instead of data.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod pull;
mod scan;
mod writer;

pub use pull::{BucketIndexBlockFinder, PullConfig};
pub use scan::{ScanBlockFinder, ScanConfig};
pub use writer::BucketIndexWriter;

use async_trait::async_trait;
use data_types::{Block, BlockId, DeletionMark, TenantId, Timestamp};
use snafu::Snafu;
use std::{collections::HashSet, fmt::Debug};

/// The serialized per-tenant index object.
///
/// A producer process rewrites the whole object on every sync; freshness is
/// judged by `updated_at` against the wall clock.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BucketIndex {
    /// When the producer last rewrote this object.
    pub updated_at: Timestamp,
    /// Every block of the tenant known to the producer.
    pub blocks: Vec<Block>,
    /// Every deletion mark of the tenant known to the producer.
    pub deletion_marks: Vec<DeletionMark>,
}

/// Object name of the per-tenant index, relative to the tenant prefix.
pub const INDEX_OBJECT_NAME: &str = "bucket-index.json";

/// Object name of a block's meta file, relative to the block prefix.
pub const META_OBJECT_NAME: &str = "meta.json";

/// Object name of a block's deletion mark, relative to the block prefix.
pub const DELETION_MARK_OBJECT_NAME: &str = "deletion-mark.json";

/// Errors resolving blocks for a tenant.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum BlockFinderError {
    #[snafu(display(
        "block catalog for tenant {} is stale, last successful refresh: {:?}",
        tenant,
        last_refresh
    ))]
    IndexStale {
        tenant: TenantId,
        last_refresh: Option<Timestamp>,
    },

    #[snafu(display("cannot read block catalog for tenant {}: {}", tenant, source))]
    ReadFailure {
        tenant: TenantId,
        source: object_store::Error,
    },

    #[snafu(display("corrupt block catalog object {} for tenant {}: {}", object, tenant, source))]
    Corrupt {
        tenant: TenantId,
        object: String,
        source: serde_json::Error,
    },
}

/// Blocks covering one queried time range, plus their deletion marks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlocksForRange {
    /// Blocks overlapping the range, sorted by `max_time` descending.
    pub blocks: Vec<Block>,
    /// Deletion marks for the returned blocks.
    pub deletion_marks: Vec<DeletionMark>,
}

impl BlocksForRange {
    /// IDs of the returned blocks, in block order.
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.blocks.iter().map(|b| b.id).collect()
    }
}

/// Resolves the candidate blocks for a `(tenant, min_t, max_t)` query.
#[async_trait]
pub trait BlockFinder: Debug + Send + Sync + 'static {
    /// Blocks overlapping the inclusive `[min_t, max_t]` range.
    async fn get_blocks(
        &self,
        tenant: &TenantId,
        min_t: Timestamp,
        max_t: Timestamp,
    ) -> Result<BlocksForRange, BlockFinderError>;
}

/// Select, sort and pair up the raw catalog content for one query range.
fn select_blocks(
    blocks: &[Block],
    deletion_marks: &[DeletionMark],
    min_t: Timestamp,
    max_t: Timestamp,
) -> BlocksForRange {
    let mut selected: Vec<Block> = blocks
        .iter()
        .filter(|b| b.overlaps(min_t, max_t))
        .cloned()
        .collect();
    // newest data first; id as tie-breaker for a fully deterministic listing
    selected.sort_by(|a, b| b.max_time.cmp(&a.max_time).then_with(|| a.id.cmp(&b.id)));

    let ids: HashSet<BlockId> = selected.iter().map(|b| b.id).collect();
    let deletion_marks = deletion_marks
        .iter()
        .filter(|m| ids.contains(&m.block_id))
        .copied()
        .collect();

    BlocksForRange {
        blocks: selected,
        deletion_marks,
    }
}


#[cfg(test)]
mod tests {
    use super::{test_fixtures::*, *};

    #[test]
    fn select_blocks_filters_sorts_and_pairs_marks() {
        let blocks = vec![
            block(1, 0, 100),
            block(2, 50, 150),
            block(3, 400, 500),
            block(4, 100, 150),
        ];
        let marks = vec![
            DeletionMark {
                block_id: BlockId::from_u128(2),
                marked_at: Timestamp::new(10),
            },
            DeletionMark {
                block_id: BlockId::from_u128(3),
                marked_at: Timestamp::new(10),
            },
        ];

        let got = select_blocks(&blocks, &marks, Timestamp::new(100), Timestamp::new(200));

        // block 3 does not overlap, its mark is not carried either
        assert_eq!(
            got.block_ids(),
            vec![
                BlockId::from_u128(2),
                BlockId::from_u128(4),
                BlockId::from_u128(1),
            ]
        );
        assert_eq!(got.deletion_marks.len(), 1);
        assert_eq!(got.deletion_marks[0].block_id, BlockId::from_u128(2));
    }

    #[test]
    fn max_time_ties_break_on_id() {
        let blocks = vec![block(2, 0, 100), block(1, 0, 100)];
        let got = select_blocks(&blocks, &[], Timestamp::new(0), Timestamp::new(100));
        assert_eq!(
            got.block_ids(),
            vec![BlockId::from_u128(1), BlockId::from_u128(2)]
        );
    }
}
