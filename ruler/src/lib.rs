//! The ruler's work-assignment loop.
//!
//! Every ruler replica periodically decides which rule groups hash to *it*
//! under the ruler ring, loads their definitions from the rule store, and
//! reconciles a local evaluation manager so that exactly the owned groups
//! are active. In steady state no group is evaluated on two replicas; during
//! ring transitions the overlap window is bounded by the time between
//! observing the change and finishing the reconciliation.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod manager;
mod ownership;
mod store;
mod sync_loop;

pub use manager::{EvaluationManager, RecordingEvaluationManager};
pub use ownership::{group_token, owns_group};
pub use store::{MockRuleStore, RuleStore, RuleStoreError};
pub use sync_loop::{Ruler, RulerConfig, SyncTrigger};

use data_types::TenantId;
use std::{fmt::Debug, time::Duration};

/// Identifier of one rule group: `(tenant, namespace, name)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleGroupKey {
    /// Owning tenant.
    pub tenant: TenantId,
    /// Namespace (typically the source rule file).
    pub namespace: String,
    /// Group name, unique within the namespace.
    pub name: String,
}

impl std::fmt::Display for RuleGroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.tenant, self.namespace, self.name)
    }
}

/// Whether a rule records a new series or fires alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum RuleKind {
    Record,
    Alert,
}

/// One rule of a group. The expression is opaque to the ruler; evaluation
/// belongs to the local manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleDef {
    /// Record name or alert name.
    pub name: String,
    /// The query expression, carried verbatim.
    pub expr: String,
    /// Record or alert.
    pub kind: RuleKind,
}

/// A rule group definition as loaded from the rule store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleGroup {
    /// The group's identifier.
    pub key: RuleGroupKey,
    /// Evaluation interval.
    pub interval: Duration,
    /// The group's rules, evaluated in order.
    pub rules: Vec<RuleDef>,
}

/// Per-tenant ruler limits.
pub trait RulerLimits: Debug + Send + Sync + 'static {
    /// Size of the tenant's ruler shuffle shard. `0` disables sharding.
    fn ruler_tenant_shard_size(&self, tenant: &TenantId) -> usize;
}

/// [`RulerLimits`] returning the same value for every tenant.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedRulerLimits {
    /// See [`RulerLimits::ruler_tenant_shard_size`].
    pub ruler_tenant_shard_size: usize,
}

impl RulerLimits for FixedRulerLimits {
    fn ruler_tenant_shard_size(&self, _tenant: &TenantId) -> usize {
        self.ruler_tenant_shard_size
    }
}
