//! The local evaluation manager the ruler reconciles.

use crate::{RuleGroup, RuleGroupKey};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{collections::BTreeMap, fmt::Debug};

/// The local engine evaluating rule groups.
///
/// The ruler only decides *which* groups run here; scheduling and expression
/// evaluation belong to the implementation. [`sync_groups`] must converge:
/// groups absent from the passed set are torn down, new ones are started
/// lazily at their next evaluation slot.
///
/// [`sync_groups`]: EvaluationManager::sync_groups
#[async_trait]
pub trait EvaluationManager: Debug + Send + Sync + 'static {
    /// Make exactly `groups` active.
    async fn sync_groups(&self, groups: Vec<RuleGroup>);
}

/// [`EvaluationManager`] that only records reconciliations, for tests.
#[derive(Debug, Default)]
pub struct RecordingEvaluationManager {
    state: Mutex<RecordingState>,
}

#[derive(Debug, Default)]
struct RecordingState {
    active: BTreeMap<RuleGroupKey, RuleGroup>,
    started: Vec<RuleGroupKey>,
    stopped: Vec<RuleGroupKey>,
    syncs: usize,
}

impl RecordingEvaluationManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Default::default()
    }

    /// Keys of the currently active groups, sorted.
    pub fn active_keys(&self) -> Vec<RuleGroupKey> {
        self.state.lock().active.keys().cloned().collect()
    }

    /// Every group start observed, in order.
    pub fn started(&self) -> Vec<RuleGroupKey> {
        self.state.lock().started.clone()
    }

    /// Every group teardown observed, in order.
    pub fn stopped(&self) -> Vec<RuleGroupKey> {
        self.state.lock().stopped.clone()
    }

    /// Number of reconciliations run.
    pub fn syncs(&self) -> usize {
        self.state.lock().syncs
    }
}

#[async_trait]
impl EvaluationManager for RecordingEvaluationManager {
    async fn sync_groups(&self, groups: Vec<RuleGroup>) {
        let mut state = self.state.lock();
        state.syncs += 1;

        let desired: BTreeMap<RuleGroupKey, RuleGroup> =
            groups.into_iter().map(|g| (g.key.clone(), g)).collect();

        let stopped: Vec<RuleGroupKey> = state
            .active
            .keys()
            .filter(|k| !desired.contains_key(*k))
            .cloned()
            .collect();
        let started: Vec<RuleGroupKey> = desired
            .keys()
            .filter(|k| !state.active.contains_key(*k))
            .cloned()
            .collect();

        state.stopped.extend(stopped);
        state.started.extend(started);
        state.active = desired;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{group, key};

    #[tokio::test]
    async fn reconciliation_diffs_active_set() {
        let manager = RecordingEvaluationManager::new();

        manager
            .sync_groups(vec![group("t1", "ns", "a"), group("t1", "ns", "b")])
            .await;
        assert_eq!(
            manager.active_keys(),
            vec![key("t1", "ns", "a"), key("t1", "ns", "b")]
        );
        assert_eq!(
            manager.started(),
            vec![key("t1", "ns", "a"), key("t1", "ns", "b")]
        );
        assert!(manager.stopped().is_empty());

        manager
            .sync_groups(vec![group("t1", "ns", "b"), group("t1", "ns", "c")])
            .await;
        assert_eq!(
            manager.active_keys(),
            vec![key("t1", "ns", "b"), key("t1", "ns", "c")]
        );
        assert_eq!(manager.stopped(), vec![key("t1", "ns", "a")]);
        assert_eq!(manager.started().last().unwrap(), &key("t1", "ns", "c"));
        assert_eq!(manager.syncs(), 2);
    }

    #[tokio::test]
    async fn empty_sync_tears_everything_down() {
        let manager = RecordingEvaluationManager::new();
        manager.sync_groups(vec![group("t1", "ns", "a")]).await;
        manager.sync_groups(vec![]).await;

        assert!(manager.active_keys().is_empty());
        assert_eq!(manager.stopped(), vec![key("t1", "ns", "a")]);
    }
}
