//! Periodic and ring-driven synchronization of the owned rule groups.

use crate::{
    manager::EvaluationManager, ownership::owns_group, store::RuleStore, RuleStoreError,
    RulerLimits,
};
use data_types::ReplicaAddr;
use metric::{Metric, U64Counter};
use observability_deps::tracing::{debug, info, warn};
use parking_lot::Mutex;
use ring::{InstanceState, RingView};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

/// What caused a sync round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// First sync after this replica became ACTIVE in the ring.
    Initial,
    /// The regular interval fired.
    Periodic,
    /// The healthy replica set changed since the last look.
    RingChange,
}

impl SyncTrigger {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Periodic => "periodic",
            Self::RingChange => "ring_change",
        }
    }
}

/// Configuration of the [`Ruler`] loop.
#[derive(Debug, Clone, Copy)]
pub struct RulerConfig {
    /// Interval of the periodic full sync.
    pub sync_interval: Duration,
    /// How often to compare the ring against the last seen membership.
    pub ring_check_interval: Duration,
}

impl Default for RulerConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(60),
            ring_check_interval: Duration::from_secs(5),
        }
    }
}

/// Keeps the local evaluation manager running exactly the rule groups this
/// replica owns.
#[derive(Debug)]
pub struct Ruler {
    store: Arc<dyn RuleStore>,
    manager: Arc<dyn EvaluationManager>,
    ring_view: Arc<RingView>,
    limits: Arc<dyn RulerLimits>,
    config: RulerConfig,
    addr: ReplicaAddr,
    sync_counter: Metric<U64Counter>,
    last_membership: Mutex<Option<Vec<(String, InstanceState, u32)>>>,
}

impl Ruler {
    /// Create a ruler for the replica at `addr`.
    pub fn new(
        store: Arc<dyn RuleStore>,
        manager: Arc<dyn EvaluationManager>,
        ring_view: Arc<RingView>,
        limits: Arc<dyn RulerLimits>,
        config: RulerConfig,
        addr: ReplicaAddr,
        metric_registry: &metric::Registry,
    ) -> Self {
        Self {
            store,
            manager,
            ring_view,
            limits,
            config,
            addr,
            sync_counter: metric_registry.register_metric(
                "ruler_sync_total",
                "number of rule group sync rounds, by trigger",
            ),
            last_membership: Default::default(),
        }
    }

    /// Run one sync round: resolve ownership, load definitions, reconcile.
    pub async fn sync(&self, trigger: SyncTrigger) -> Result<(), RuleStoreError> {
        self.sync_counter
            .recorder(&[("reason", trigger.as_str())])
            .inc(1);

        let ring = self.ring_view.snapshot();
        let keys = self.store.list_groups().await?;
        let n_total = keys.len();

        let owned: Vec<_> = keys
            .into_iter()
            .filter(|key| owns_group(&ring, key, &self.addr, self.limits.as_ref()))
            .collect();
        let groups = self.store.load_groups(&owned).await?;

        debug!(
            trigger = trigger.as_str(),
            n_total,
            n_owned = groups.len(),
            "reconciling owned rule groups"
        );
        self.manager.sync_groups(groups).await;
        Ok(())
    }

    /// Whether the healthy membership changed since the last call.
    ///
    /// The first call records the baseline and reports no change.
    fn ring_changed(&self) -> bool {
        let fingerprint = self.ring_view.snapshot().membership_fingerprint();
        let mut last = self.last_membership.lock();
        match last.replace(fingerprint.clone()) {
            Some(previous) => previous != fingerprint,
            None => false,
        }
    }

    fn is_active_in_ring(&self) -> bool {
        self.ring_view
            .snapshot()
            .instance_by_addr(&self.addr)
            .map(|i| i.state == InstanceState::Active)
            .unwrap_or(false)
    }

    /// Drive syncs until `shutdown` fires.
    ///
    /// The initial sync waits for this replica to be ACTIVE in the ring;
    /// afterwards the loop syncs periodically and whenever the healthy
    /// membership changes.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        // initial: not before we are a real ring member
        loop {
            if self.is_active_in_ring() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.ring_check_interval) => {}
                _ = shutdown.cancelled() => {
                    info!("ruler shutdown before becoming active");
                    return;
                }
            }
        }
        if let Err(e) = self.sync(SyncTrigger::Initial).await {
            warn!(%e, "initial rule group sync failed");
        }
        // baseline for change detection
        self.ring_changed();

        let mut periodic = tokio::time::interval(self.config.sync_interval);
        let mut ring_check = tokio::time::interval(self.config.ring_check_interval);
        // both tick immediately once; the initial sync just ran
        periodic.tick().await;
        ring_check.tick().await;

        loop {
            let trigger = tokio::select! {
                _ = periodic.tick() => Some(SyncTrigger::Periodic),
                _ = ring_check.tick() => self.ring_changed().then_some(SyncTrigger::RingChange),
                _ = shutdown.cancelled() => {
                    info!("ruler shutdown");
                    return;
                }
            };

            if let Some(trigger) = trigger {
                if let Err(e) = self.sync(trigger).await {
                    warn!(%e, trigger = trigger.as_str(), "rule group sync failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        manager::RecordingEvaluationManager, store::MockRuleStore, test_fixtures::group,
        FixedRulerLimits,
    };
    use metric::{Attributes, Registry};
    use ring::{InstanceDesc, Ring, RingDesc};
    use tephra_time::Time;

    fn instance(id: &str, tokens: Vec<u32>, state: InstanceState) -> InstanceDesc {
        InstanceDesc {
            id: id.to_string(),
            addr: ReplicaAddr::new(format!("{id}:9096")),
            tokens,
            state,
            heartbeat: Time::from_timestamp_millis(0),
        }
    }

    fn ring_of(instances: Vec<InstanceDesc>) -> Ring {
        Ring::new(
            &RingDesc { instances },
            Duration::from_secs(60),
            Time::from_timestamp_millis(0),
        )
    }

    struct TestRuler {
        ruler: Arc<Ruler>,
        store: Arc<MockRuleStore>,
        manager: Arc<RecordingEvaluationManager>,
        ring_view: Arc<RingView>,
        registry: Arc<Registry>,
    }

    impl TestRuler {
        fn new(config: RulerConfig) -> Self {
            test_helpers::maybe_start_logging();

            let store = Arc::new(MockRuleStore::new());
            let manager = Arc::new(RecordingEvaluationManager::new());
            let ring_view = Arc::new(RingView::empty());
            let registry = Arc::new(Registry::new());

            let ruler = Arc::new(Ruler::new(
                Arc::clone(&store) as _,
                Arc::clone(&manager) as _,
                Arc::clone(&ring_view),
                Arc::new(FixedRulerLimits::default()),
                config,
                ReplicaAddr::new("ruler-1:9096"),
                &registry,
            ));
            Self {
                ruler,
                store,
                manager,
                ring_view,
                registry,
            }
        }

        fn sync_count(&self, reason: &'static str) -> u64 {
            let metric: Metric<U64Counter> =
                self.registry.get_instrument("ruler_sync_total").unwrap();
            metric
                .get_observer(&Attributes::from(&[("reason", reason)]))
                .map(|o| o.fetch())
                .unwrap_or_default()
        }
    }

    #[tokio::test]
    async fn sync_activates_exactly_the_owned_groups() {
        let t = TestRuler::new(RulerConfig::default());
        // a single-replica ring owns everything
        t.ring_view.update(ring_of(vec![instance(
            "ruler-1",
            vec![0x8000_0000],
            InstanceState::Active,
        )]));

        t.store.upsert(group("t1", "ns", "a"));
        t.store.upsert(group("t2", "ns", "b"));

        t.ruler.sync(SyncTrigger::Periodic).await.unwrap();

        assert_eq!(t.manager.active_keys().len(), 2);
        assert_eq!(t.sync_count("periodic"), 1);
    }

    #[tokio::test]
    async fn sync_tears_down_groups_lost_to_another_replica() {
        let t = TestRuler::new(RulerConfig::default());
        t.ring_view.update(ring_of(vec![instance(
            "ruler-1",
            vec![0x8000_0000],
            InstanceState::Active,
        )]));
        t.store.upsert(group("t1", "ns", "a"));
        t.ruler.sync(SyncTrigger::Initial).await.unwrap();
        assert_eq!(t.manager.active_keys().len(), 1);

        // another replica takes over the whole ring
        t.ring_view.update(ring_of(vec![
            instance("ruler-1", vec![], InstanceState::Active),
            instance("ruler-2", vec![0x8000_0000], InstanceState::Active),
        ]));
        t.ruler.sync(SyncTrigger::RingChange).await.unwrap();

        assert!(t.manager.active_keys().is_empty());
        assert_eq!(t.manager.stopped().len(), 1);
        assert_eq!(t.sync_count("ring_change"), 1);
    }

    #[tokio::test]
    async fn store_outage_keeps_previous_state() {
        let t = TestRuler::new(RulerConfig::default());
        t.ring_view.update(ring_of(vec![instance(
            "ruler-1",
            vec![0x8000_0000],
            InstanceState::Active,
        )]));
        t.store.upsert(group("t1", "ns", "a"));
        t.ruler.sync(SyncTrigger::Initial).await.unwrap();

        t.store.set_unavailable(true);
        t.ruler.sync(SyncTrigger::Periodic).await.unwrap_err();

        assert_eq!(t.manager.active_keys().len(), 1);
    }

    #[tokio::test]
    async fn ring_change_detection_needs_a_baseline() {
        let t = TestRuler::new(RulerConfig::default());
        t.ring_view.update(ring_of(vec![instance(
            "ruler-1",
            vec![0x8000_0000],
            InstanceState::Active,
        )]));

        assert!(!t.ruler.ring_changed());
        assert!(!t.ruler.ring_changed());

        t.ring_view.update(ring_of(vec![
            instance("ruler-1", vec![0x8000_0000], InstanceState::Active),
            instance("ruler-2", vec![0xc000_0000], InstanceState::Active),
        ]));
        assert!(t.ruler.ring_changed());
        assert!(!t.ruler.ring_changed());
    }

    #[tokio::test]
    async fn run_waits_for_active_then_follows_ring_changes() {
        let t = TestRuler::new(RulerConfig {
            sync_interval: Duration::from_secs(3600),
            ring_check_interval: Duration::from_millis(10),
        });
        t.store.upsert(group("t1", "ns", "a"));

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&t.ruler).run(shutdown.clone()));

        // not active yet: no sync happens
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(t.manager.syncs(), 0);

        // join the ring: the initial sync picks up the group
        t.ring_view.update(ring_of(vec![instance(
            "ruler-1",
            vec![0x8000_0000],
            InstanceState::Active,
        )]));
        wait_until(|| t.sync_count("initial") == 1).await;
        assert_eq!(t.manager.active_keys().len(), 1);

        // a membership change triggers another sync
        t.ring_view.update(ring_of(vec![
            instance("ruler-1", vec![0x8000_0000], InstanceState::Active),
            instance("ruler-2", vec![0xc000_0000], InstanceState::Active),
        ]));
        wait_until(|| t.sync_count("ring_change") >= 1).await;

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    async fn wait_until(predicate: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !predicate() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }
}
