//! The block-storage query engine.
//!
//! For every read the engine resolves the blocks expected to hold data
//! (block finder), drops blocks the query's shard provably cannot need
//! (shard filter), fans sub-queries out to the store-gateway replicas owning
//! those blocks (replica selector), and verifies via the replicas' own hints
//! that every expected block was in fact consulted (consistency checker),
//! retrying the residual against alternate replicas until the expectation is
//! met or attempts are exhausted.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod consistency;
mod fanout;
mod limits;
mod merge;
mod metrics;
mod replica_selection;
mod sharding;
mod tenant_limits;

pub use consistency::{BlockConsistencyChecker, ConsistencyConfig};
pub use fanout::{
    BlockStoreQuerier, BlockStoreQuerierConfig, LabelsResult, QueryError, QueryStats, SeriesResult,
};
pub use limits::{LimitError, LimitKind, QueryLimiter, QueryLimits};
pub use merge::{merge_series, merge_string_sets};
pub use metrics::QuerierMetrics;
pub use replica_selection::{BlockReplicaSelection, ReplicaSelector, SelectionError};
pub use sharding::filter_blocks_by_shard;
pub use tenant_limits::{FixedTenantLimits, TenantLimits};
