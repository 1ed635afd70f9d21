//! Reconciling blocks expected against blocks actually queried.

use data_types::{Block, BlockId, DeletionMark, Timestamp};
use observability_deps::tracing::debug;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tephra_time::{Time, TimeProvider};

/// Windows bounding when the catalog and the replicas may legitimately
/// disagree.
#[derive(Debug, Clone, Copy)]
pub struct ConsistencyConfig {
    /// How long after upload a block must at the latest be loaded by the
    /// replicas owning it.
    pub consistency_delay: Duration,

    /// The catalog producer's sync interval. Replicas may lag the catalog by
    /// a few sync rounds.
    pub sync_interval: Duration,

    /// How long replicas keep serving a block after its deletion mark
    /// appears. Half of this is the grace within which a marked block may
    /// already be gone from every replica.
    pub ignore_deletion_marks_delay: Duration,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            consistency_delay: Duration::from_secs(30 * 60),
            sync_interval: Duration::from_secs(15 * 60),
            ignore_deletion_marks_delay: Duration::from_secs(60 * 60),
        }
    }
}

impl ConsistencyConfig {
    /// Blocks uploaded within this window are not yet required to be served.
    fn upload_grace(&self) -> Duration {
        self.consistency_delay + 3 * self.sync_interval
    }

    /// Blocks marked for deletion longer ago than this may already be gone.
    fn deletion_grace(&self) -> Duration {
        self.ignore_deletion_marks_delay / 2
    }
}

/// Verifies that every block a query expected was consulted by some replica.
#[derive(Debug)]
pub struct BlockConsistencyChecker {
    config: ConsistencyConfig,
    time_provider: Arc<dyn TimeProvider>,
}

impl BlockConsistencyChecker {
    /// Create a checker.
    pub fn new(config: ConsistencyConfig, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            config,
            time_provider,
        }
    }

    /// Drop blocks whose deletion mark is old enough that replicas may have
    /// already unloaded them. Called when building the expected set, before
    /// any replica is contacted.
    pub fn exclude_marked_for_deletion(
        &self,
        blocks: Vec<Block>,
        deletion_marks: &[DeletionMark],
    ) -> Vec<Block> {
        let now = self.time_provider.now();
        let marks = marks_by_block(deletion_marks);

        let before = blocks.len();
        let blocks: Vec<Block> = blocks
            .into_iter()
            .filter(|b| match marks.get(&b.id) {
                Some(marked_at) => !older_than(now, **marked_at, self.config.deletion_grace()),
                None => true,
            })
            .collect();
        if blocks.len() != before {
            debug!(
                n_excluded = before - blocks.len(),
                "excluded blocks marked for deletion beyond the grace window"
            );
        }
        blocks
    }

    /// The smallest set of blocks in `expected` that were neither reported
    /// as queried nor fall into one of the grace windows.
    pub fn check(
        &self,
        expected: &[Block],
        deletion_marks: &[DeletionMark],
        queried: &HashSet<BlockId>,
    ) -> Vec<BlockId> {
        let now = self.time_provider.now();
        let marks = marks_by_block(deletion_marks);

        expected
            .iter()
            .filter(|b| {
                if queried.contains(&b.id) {
                    return false;
                }
                // not yet required: the replicas may not have synced it
                if !older_than(now, b.uploaded_at, self.config.upload_grace()) {
                    return false;
                }
                // already excusable: marked for deletion past the grace
                if let Some(marked_at) = marks.get(&b.id) {
                    if older_than(now, **marked_at, self.config.deletion_grace()) {
                        return false;
                    }
                }
                true
            })
            .map(|b| b.id)
            .collect()
    }
}

fn marks_by_block(deletion_marks: &[DeletionMark]) -> HashMap<BlockId, &Timestamp> {
    deletion_marks
        .iter()
        .map(|m| (m.block_id, &m.marked_at))
        .collect()
}

fn older_than(now: Time, t: Timestamp, window: Duration) -> bool {
    now.checked_duration_since(Time::from_timestamp_millis(t.get()))
        .map(|age| age > window)
        // t in the future counts as brand new
        .unwrap_or(false)
}
