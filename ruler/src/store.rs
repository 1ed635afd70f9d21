//! The rule store the ruler loads group definitions from.

use crate::{RuleGroup, RuleGroupKey};
use async_trait::async_trait;
use parking_lot::Mutex;
use snafu::Snafu;
use std::{collections::BTreeMap, fmt::Debug};

/// Errors reading from the rule store.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum RuleStoreError {
    #[snafu(display("rule store unavailable: {}", reason))]
    Unavailable { reason: String },
}

/// Read access to the configured rule groups of all tenants.
#[async_trait]
pub trait RuleStore: Debug + Send + Sync + 'static {
    /// Every group key known to the store, across tenants.
    async fn list_groups(&self) -> Result<Vec<RuleGroupKey>, RuleStoreError>;

    /// Load the definitions of `keys`. Keys unknown to the store (deleted
    /// between list and load) are silently absent from the result.
    async fn load_groups(&self, keys: &[RuleGroupKey]) -> Result<Vec<RuleGroup>, RuleStoreError>;
}

/// In-memory [`RuleStore`] for tests.
#[derive(Debug, Default)]
pub struct MockRuleStore {
    groups: Mutex<BTreeMap<RuleGroupKey, RuleGroup>>,
    unavailable: Mutex<bool>,
}

impl MockRuleStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Default::default()
    }

    /// Add (or replace) a group definition.
    pub fn upsert(&self, group: RuleGroup) {
        self.groups.lock().insert(group.key.clone(), group);
    }

    /// Remove a group definition.
    pub fn remove(&self, key: &RuleGroupKey) {
        self.groups.lock().remove(key);
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }

    fn check_available(&self) -> Result<(), RuleStoreError> {
        if *self.unavailable.lock() {
            return Err(RuleStoreError::Unavailable {
                reason: "mock outage".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RuleStore for MockRuleStore {
    async fn list_groups(&self) -> Result<Vec<RuleGroupKey>, RuleStoreError> {
        self.check_available()?;
        Ok(self.groups.lock().keys().cloned().collect())
    }

    async fn load_groups(&self, keys: &[RuleGroupKey]) -> Result<Vec<RuleGroup>, RuleStoreError> {
        self.check_available()?;
        let groups = self.groups.lock();
        Ok(keys.iter().filter_map(|k| groups.get(k).cloned()).collect())
    }
}
