//! Producer-side helpers writing catalog objects.
//!
//! The engine only consumes catalogs; this writer exists so tests and tools
//! can lay out buckets exactly the way the external producer does.

use crate::{BucketIndex, DELETION_MARK_OBJECT_NAME, INDEX_OBJECT_NAME, META_OBJECT_NAME};
use bytes::Bytes;
use data_types::{Block, DeletionMark, TenantId};
use object_store::{path::Path, DynObjectStore};
use snafu::{ResultExt, Snafu};
use std::sync::Arc;

/// Errors writing catalog objects.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum WriteError {
    #[snafu(display("cannot serialize catalog object: {}", source))]
    Serialize { source: serde_json::Error },

    #[snafu(display("cannot store catalog object: {}", source))]
    Store { source: object_store::Error },
}

/// Writes catalog objects in the layout both finder variants read.
#[derive(Debug)]
pub struct BucketIndexWriter {
    store: Arc<DynObjectStore>,
}

impl BucketIndexWriter {
    /// Create a writer over `store`.
    pub fn new(store: Arc<DynObjectStore>) -> Self {
        Self { store }
    }

    /// Write (or overwrite) the tenant's `bucket-index.json`.
    pub async fn write_index(
        &self,
        tenant: &TenantId,
        index: &BucketIndex,
    ) -> Result<(), WriteError> {
        self.put_json(format!("{tenant}/{INDEX_OBJECT_NAME}"), index)
            .await
    }

    /// Write a block's `meta.json`.
    pub async fn write_block_meta(&self, tenant: &TenantId, block: &Block) -> Result<(), WriteError> {
        self.put_json(format!("{tenant}/{}/{META_OBJECT_NAME}", block.id), block)
            .await
    }

    /// Write a block's `deletion-mark.json`.
    pub async fn write_deletion_mark(
        &self,
        tenant: &TenantId,
        mark: &DeletionMark,
    ) -> Result<(), WriteError> {
        self.put_json(
            format!("{tenant}/{}/{DELETION_MARK_OBJECT_NAME}", mark.block_id),
            mark,
        )
        .await
    }

    async fn put_json<T: serde::Serialize>(
        &self,
        location: String,
        value: &T,
    ) -> Result<(), WriteError> {
        let data = serde_json::to_vec(value).context(SerializeSnafu)?;
        self.store
            .put(&Path::from(location), Bytes::from(data))
            .await
            .context(StoreSnafu)
    }
}
