//! The scan variant: enumerate per-block objects instead of reading a
//! pre-built index.

use crate::{
    select_blocks, BlockFinder, BlockFinderError, BlocksForRange, CorruptSnafu, ReadFailureSnafu,
    DELETION_MARK_OBJECT_NAME, META_OBJECT_NAME,
};
use async_trait::async_trait;
use data_types::{Block, DeletionMark, TenantId, Timestamp};
use futures::{StreamExt, TryStreamExt};
use object_store::{path::Path, DynObjectStore};
use observability_deps::tracing::debug;
use snafu::ResultExt;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Configuration of the [`ScanBlockFinder`].
#[derive(Debug, Clone, Copy)]
pub struct ScanConfig {
    /// How many `meta.json` / `deletion-mark.json` objects to fetch in
    /// parallel within one scan.
    pub meta_fetch_concurrency: usize,

    /// How many tenants may be scanned concurrently by this finder.
    pub tenant_concurrency: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            meta_fetch_concurrency: 32,
            tenant_concurrency: 8,
        }
    }
}

/// [`BlockFinder`] listing `<tenant>/<block>/meta.json` objects on demand.
///
/// Every call performs a fresh listing, so there is no staleness window
/// beyond the object store's own consistency; the price is one LIST plus one
/// GET per block meta on every query.
#[derive(Debug)]
pub struct ScanBlockFinder {
    store: Arc<DynObjectStore>,
    config: ScanConfig,
    tenant_gate: Semaphore,
}

impl ScanBlockFinder {
    /// Create a finder scanning `store`.
    pub fn new(store: Arc<DynObjectStore>, config: ScanConfig) -> Self {
        Self {
            store,
            config,
            tenant_gate: Semaphore::new(config.tenant_concurrency),
        }
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(
        &self,
        tenant: &TenantId,
        location: Path,
    ) -> Result<T, BlockFinderError> {
        let data = self
            .store
            .get(&location)
            .await
            .context(ReadFailureSnafu {
                tenant: tenant.clone(),
            })?
            .bytes()
            .await
            .context(ReadFailureSnafu {
                tenant: tenant.clone(),
            })?;

        serde_json::from_slice(&data).context(CorruptSnafu {
            tenant: tenant.clone(),
            object: location.to_string(),
        })
    }
}

#[async_trait]
impl BlockFinder for ScanBlockFinder {
    async fn get_blocks(
        &self,
        tenant: &TenantId,
        min_t: Timestamp,
        max_t: Timestamp,
    ) -> Result<BlocksForRange, BlockFinderError> {
        // bounds concurrent scans; the semaphore is never closed
        let _permit = self
            .tenant_gate
            .acquire()
            .await
            .expect("tenant gate never closed");

        let prefix = Path::from(tenant.as_str());
        let listing: Vec<_> = self
            .store
            .list(Some(&prefix))
            .await
            .context(ReadFailureSnafu {
                tenant: tenant.clone(),
            })?
            .try_collect()
            .await
            .context(ReadFailureSnafu {
                tenant: tenant.clone(),
            })?;

        let mut meta_paths = vec![];
        let mut mark_paths = vec![];
        for object in listing {
            let raw = object.location.to_string();
            if raw.ends_with(META_OBJECT_NAME) {
                meta_paths.push(object.location);
            } else if raw.ends_with(DELETION_MARK_OBJECT_NAME) {
                mark_paths.push(object.location);
            }
        }
        debug!(
            %tenant,
            n_metas = meta_paths.len(),
            n_marks = mark_paths.len(),
            "scanned tenant prefix"
        );

        let blocks: Vec<Block> = futures::stream::iter(meta_paths)
            .map(|location| self.fetch_json::<Block>(tenant, location))
            .buffer_unordered(self.config.meta_fetch_concurrency)
            .try_collect()
            .await?;

        let deletion_marks: Vec<DeletionMark> = futures::stream::iter(mark_paths)
            .map(|location| self.fetch_json::<DeletionMark>(tenant, location))
            .buffer_unordered(self.config.meta_fetch_concurrency)
            .try_collect()
            .await?;

        Ok(select_blocks(&blocks, &deletion_marks, min_t, max_t))
    }
}
