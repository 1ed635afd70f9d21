//! Shard-compatibility filtering of candidate blocks.

use data_types::{Block, ShardSelector};
use observability_deps::tracing::debug;

/// Drop blocks that provably cannot contain series of the query's shard.
///
/// A block compacted as shard `ci_of_cc` holds exactly the series whose hash
/// is `ci (mod cc)`. When one of the two shard counts divides the other, a
/// query for shard `qi_of_qc` can therefore skip every block whose series
/// congruence class cannot intersect its own:
///
/// - `qc % cc == 0` (query at least as fine): keep iff `qi ≡ ci (mod cc)`
/// - `cc % qc == 0` (compaction finer): keep iff `ci ≡ qi (mod qc)`
///
/// When neither count divides the other the congruence classes overlap
/// partially; such blocks are kept and counted in the returned incompatible
/// total. Blocks without a compactor shard are always kept. Input order is
/// preserved, the downstream merge relies on it.
pub fn filter_blocks_by_shard(
    blocks: Vec<Block>,
    selector: ShardSelector,
) -> (Vec<Block>, usize) {
    let qi = selector.index();
    let qc = selector.count();

    let mut incompatible = 0;
    let mut kept = Vec::with_capacity(blocks.len());
    for block in blocks {
        let keep = match &block.compactor_shard {
            None => true,
            Some(shard) => {
                let ci = u64::from(shard.index());
                let cc = u64::from(shard.of());
                if qc % cc == 0 {
                    qi % cc == ci
                } else if cc % qc == 0 {
                    ci % qc == qi
                } else {
                    incompatible += 1;
                    true
                }
            }
        };
        if keep {
            kept.push(block);
        }
    }

    debug!(
        %selector,
        n_kept = kept.len(),
        n_incompatible = incompatible,
        "filtered blocks by query shard"
    );
    (kept, incompatible)
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{BlockId, CompactorShardId, Timestamp};

    fn block(id: u128, compactor_shard: Option<&str>) -> Block {
        Block {
            id: BlockId::from_u128(id),
            min_time: Timestamp::new(0),
            max_time: Timestamp::new(100),
            compactor_shard: compactor_shard.map(|s| s.parse::<CompactorShardId>().unwrap()),
            uploaded_at: Timestamp::new(0),
        }
    }

    fn selector(index: u64, count: u64) -> ShardSelector {
        ShardSelector::new(index, count).unwrap()
    }

    #[test]
    fn query_finer_than_compaction() {
        // four compactor shards, query shard 5_of_8: 8 % 4 == 0 and
        // 5 mod 4 == 1, so only 1_of_4 can match
        let blocks = vec![
            block(0, Some("0_of_4")),
            block(1, Some("1_of_4")),
            block(2, Some("2_of_4")),
            block(3, Some("3_of_4")),
        ];

        let (kept, incompatible) = filter_blocks_by_shard(blocks, selector(5, 8));
        assert_eq!(
            kept.iter().map(|b| b.id).collect::<Vec<_>>(),
            vec![BlockId::from_u128(1)]
        );
        assert_eq!(incompatible, 0);
    }

    #[test]
    fn compaction_finer_than_query() {
        // 8 compactor shards, query 1_of_2: keep ci with ci mod 2 == 1
        let blocks: Vec<_> = (0..8).map(|i| block(i, Some(&format!("{i}_of_8")))).collect();

        let (kept, incompatible) = filter_blocks_by_shard(blocks, selector(1, 2));
        assert_eq!(
            kept.iter().map(|b| b.id.as_u128()).collect::<Vec<_>>(),
            vec![1, 3, 5, 7]
        );
        assert_eq!(incompatible, 0);
    }

    #[test]
    fn incompatible_counts_are_kept() {
        // neither 3 | 2 nor 2 | 3: the filter cannot prove anything
        let blocks = vec![block(0, Some("0_of_3")), block(1, Some("1_of_3"))];

        let (kept, incompatible) = filter_blocks_by_shard(blocks, selector(1, 2));
        assert_eq!(kept.len(), 2);
        assert_eq!(incompatible, 2);
    }

    #[test]
    fn unsharded_blocks_always_kept() {
        let blocks = vec![block(0, None), block(1, Some("0_of_4"))];
        let (kept, _) = filter_blocks_by_shard(blocks, selector(1, 4));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, BlockId::from_u128(0));
    }

    #[test]
    fn shard_0_of_1_is_the_identity() {
        let blocks = vec![
            block(0, None),
            block(1, Some("0_of_4")),
            block(2, Some("3_of_4")),
            block(3, Some("2_of_3")),
        ];
        let ids: Vec<_> = blocks.iter().map(|b| b.id).collect();

        let (kept, incompatible) = filter_blocks_by_shard(blocks, selector(0, 1));
        assert_eq!(kept.iter().map(|b| b.id).collect::<Vec<_>>(), ids);
        assert_eq!(incompatible, 0);
    }

    #[test]
    fn input_order_is_preserved() {
        let blocks = vec![
            block(5, Some("1_of_2")),
            block(1, None),
            block(9, Some("1_of_2")),
        ];
        let (kept, _) = filter_blocks_by_shard(blocks, selector(1, 2));
        assert_eq!(
            kept.iter().map(|b| b.id.as_u128()).collect::<Vec<_>>(),
            vec![5, 1, 9]
        );
    }
}
