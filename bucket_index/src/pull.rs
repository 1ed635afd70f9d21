//! The pull variant: per-tenant index objects cached in memory.

use crate::{
    select_blocks, BlockFinder, BlockFinderError, BlocksForRange, BucketIndex, CorruptSnafu,
    ReadFailureSnafu, INDEX_OBJECT_NAME,
};
use async_trait::async_trait;
use backoff::{Backoff, BackoffConfig};
use data_types::{TenantId, Timestamp};
use metric::{U64Counter, U64Gauge};
use object_store::{path::Path, DynObjectStore};
use observability_deps::tracing::{debug, info, warn};
use snafu::ResultExt;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tephra_time::{Time, TimeProvider};
use tokio_util::sync::CancellationToken;

/// Configuration of the [`BucketIndexBlockFinder`].
#[derive(Debug, Clone)]
pub struct PullConfig {
    /// Re-read a tenant's index object when the cached copy is older than
    /// this.
    pub sync_interval: Duration,

    /// Refuse to serve from an index that could not be refreshed for longer
    /// than this, or whose producer stopped updating it for longer than this.
    pub max_stale_period: Duration,

    /// Drop cached tenants that have not been queried for this long.
    pub idle_timeout: Duration,

    /// Backoff applied to failing refresh attempts. The deadline bounds how
    /// long one query blocks on a refresh.
    pub refresh_backoff: BackoffConfig,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(15 * 60),
            max_stale_period: Duration::from_secs(60 * 60),
            idle_timeout: Duration::from_secs(60 * 60),
            refresh_backoff: BackoffConfig {
                deadline: Some(Duration::from_secs(10)),
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Default)]
struct TenantInner {
    index: Option<BucketIndex>,
    last_refresh: Option<Time>,
}

#[derive(Debug)]
struct TenantState {
    /// Serializes refreshes: concurrent queries for the same tenant wait for
    /// one in-flight refresh instead of racing their own.
    inner: tokio::sync::Mutex<TenantInner>,

    /// Touched on every query; read by the eviction pass without taking the
    /// async lock.
    last_used: parking_lot::Mutex<Time>,
}

/// [`BlockFinder`] reading the per-tenant `bucket-index.json` object.
///
/// Indexes are cached per tenant and refreshed once they are older than the
/// sync interval. A missing index object is treated as an empty catalog (a
/// tenant that has not uploaded blocks yet). Tenants idle beyond the
/// configured timeout are evicted by [`run_eviction`](Self::run_eviction).
#[derive(Debug)]
pub struct BucketIndexBlockFinder {
    store: Arc<DynObjectStore>,
    config: PullConfig,
    time_provider: Arc<dyn TimeProvider>,
    tenants: parking_lot::Mutex<HashMap<TenantId, Arc<TenantState>>>,
    load_success: U64Counter,
    load_failure: U64Counter,
    loaded_tenants: U64Gauge,
}

impl BucketIndexBlockFinder {
    /// Create a finder reading from `store`.
    pub fn new(
        store: Arc<DynObjectStore>,
        config: PullConfig,
        time_provider: Arc<dyn TimeProvider>,
        metric_registry: &metric::Registry,
    ) -> Self {
        let loads = metric_registry.register_metric::<U64Counter>(
            "bucket_index_loads",
            "count of bucket index load attempts, by result",
        );
        let loaded_tenants = metric_registry
            .register_metric::<U64Gauge>(
                "bucket_index_loaded_tenants",
                "number of tenants with a cached bucket index",
            )
            .recorder(&[("variant", "pull")]);

        Self {
            store,
            config,
            time_provider,
            tenants: Default::default(),
            load_success: loads.recorder(&[("result", "success")]),
            load_failure: loads.recorder(&[("result", "failure")]),
            loaded_tenants,
        }
    }

    fn tenant_state(&self, tenant: &TenantId, now: Time) -> Arc<TenantState> {
        let mut tenants = self.tenants.lock();
        let state = tenants
            .entry(tenant.clone())
            .or_insert_with(|| {
                Arc::new(TenantState {
                    inner: Default::default(),
                    last_used: parking_lot::Mutex::new(now),
                })
            });
        let state = Arc::clone(state);
        self.loaded_tenants.set(tenants.len() as u64);
        state
    }

    async fn load_index(&self, tenant: &TenantId) -> Result<BucketIndex, BlockFinderError> {
        let location = Path::from(format!("{tenant}/{INDEX_OBJECT_NAME}"));

        let result = self.store.get(&location).await;
        let data = match result {
            Ok(r) => r.bytes().await.context(ReadFailureSnafu {
                tenant: tenant.clone(),
            })?,
            Err(object_store::Error::NotFound { .. }) => {
                // tenant without blocks: the producer writes the index only
                // once the first block lands
                debug!(%tenant, "no bucket index object, treating tenant as empty");
                return Ok(BucketIndex {
                    updated_at: Timestamp::new(self.time_provider.now().timestamp_millis()),
                    ..Default::default()
                });
            }
            Err(e) => {
                return Err(e).context(ReadFailureSnafu {
                    tenant: tenant.clone(),
                })
            }
        };

        serde_json::from_slice(&data).context(CorruptSnafu {
            tenant: tenant.clone(),
            object: location.to_string(),
        })
    }

    async fn refreshed_index(
        &self,
        tenant: &TenantId,
        state: &TenantState,
        now: Time,
    ) -> Result<BucketIndex, BlockFinderError> {
        let mut inner = state.inner.lock().await;

        let needs_refresh = match inner.last_refresh {
            None => true,
            Some(last) => now
                .checked_duration_since(last)
                .map(|age| age >= self.config.sync_interval)
                .unwrap_or(false),
        };

        if needs_refresh {
            let refreshed = Backoff::new(&self.config.refresh_backoff)
                .retry_all_errors("load bucket index", || self.load_index(tenant))
                .await;

            match refreshed {
                Ok(index) => {
                    self.load_success.inc(1);
                    debug!(
                        %tenant,
                        n_blocks = index.blocks.len(),
                        n_deletion_marks = index.deletion_marks.len(),
                        "refreshed bucket index"
                    );
                    inner.index = Some(index);
                    inner.last_refresh = Some(now);
                }
                Err(e) => {
                    self.load_failure.inc(1);
                    let within_tolerance = inner
                        .last_refresh
                        .map(|last| {
                            now.checked_duration_since(last)
                                .map(|age| age <= self.config.max_stale_period)
                                .unwrap_or(true)
                        })
                        .unwrap_or(false);
                    if !within_tolerance {
                        if inner.index.is_none() {
                            return Err(e.source);
                        }
                        return Err(BlockFinderError::IndexStale {
                            tenant: tenant.clone(),
                            last_refresh: inner
                                .last_refresh
                                .map(|t| Timestamp::new(t.timestamp_millis())),
                        });
                    }
                    warn!(
                        %tenant,
                        e = %e,
                        "bucket index refresh failed, serving cached copy"
                    );
                }
            }
        }

        // refreshed or cached, the producer itself must still be alive
        let index = inner.index.as_ref().expect("index loaded by now");
        let produced_at = Time::from_timestamp_millis(index.updated_at.get());
        let producer_stale = now
            .checked_duration_since(produced_at)
            .map(|age| age > self.config.max_stale_period)
            .unwrap_or(false);
        if producer_stale {
            return Err(BlockFinderError::IndexStale {
                tenant: tenant.clone(),
                last_refresh: Some(index.updated_at),
            });
        }

        Ok(index.clone())
    }

    /// Drop tenants that have not been queried within the idle timeout.
    pub fn evict_idle_tenants(&self) {
        let now = self.time_provider.now();
        let mut tenants = self.tenants.lock();
        tenants.retain(|tenant, state| {
            let keep = now
                .checked_duration_since(*state.last_used.lock())
                .map(|age| age <= self.config.idle_timeout)
                .unwrap_or(true);
            if !keep {
                debug!(%tenant, "evicting idle bucket index");
            }
            keep
        });
        self.loaded_tenants.set(tenants.len() as u64);
    }

    /// Periodically evict idle tenants until `shutdown` fires.
    pub async fn run_eviction(self: Arc<Self>, shutdown: CancellationToken) {
        let check_interval = self.config.idle_timeout / 2;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(check_interval) => {}
                _ = shutdown.cancelled() => {
                    info!("bucket index eviction loop shutdown");
                    return;
                }
            }
            self.evict_idle_tenants();
        }
    }
}

#[async_trait]
impl BlockFinder for BucketIndexBlockFinder {
    async fn get_blocks(
        &self,
        tenant: &TenantId,
        min_t: Timestamp,
        max_t: Timestamp,
    ) -> Result<BlocksForRange, BlockFinderError> {
        let now = self.time_provider.now();
        let state = self.tenant_state(tenant, now);
        *state.last_used.lock() = now;

        let index = self.refreshed_index(tenant, &state, now).await?;
        Ok(select_blocks(
            &index.blocks,
            &index.deletion_marks,
            min_t,
            max_t,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_fixtures::*, BucketIndexWriter};
    use bytes::Bytes;
    use data_types::BlockId;
    use metric::{Attributes, Metric, Registry};
    use object_store::memory::InMemory;
    use tephra_time::MockProvider;

    struct TestFinder {
        finder: Arc<BucketIndexBlockFinder>,
        writer: BucketIndexWriter,
        store: Arc<DynObjectStore>,
        time_provider: Arc<MockProvider>,
        registry: Arc<Registry>,
    }

    impl TestFinder {
        fn new(config: PullConfig) -> Self {
            test_helpers::maybe_start_logging();

            let store: Arc<DynObjectStore> = Arc::new(InMemory::new());
            let time_provider = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));
            let registry = Arc::new(Registry::new());
            let finder = Arc::new(BucketIndexBlockFinder::new(
                Arc::clone(&store),
                config,
                Arc::clone(&time_provider) as _,
                &registry,
            ));
            Self {
                finder,
                writer: BucketIndexWriter::new(Arc::clone(&store)),
                store,
                time_provider,
                registry,
            }
        }

        fn load_counter(&self, result: &'static str) -> u64 {
            let metric: Metric<U64Counter> =
                self.registry.get_instrument("bucket_index_loads").unwrap();
            metric
                .get_observer(&Attributes::from(&[("result", result)]))
                .map(|o| o.fetch())
                .unwrap_or_default()
        }
    }

    fn test_config() -> PullConfig {
        PullConfig {
            sync_interval: Duration::from_secs(60),
            max_stale_period: Duration::from_secs(600),
            idle_timeout: Duration::from_secs(3600),
            // a single attempt per refresh
            refresh_backoff: BackoffConfig {
                deadline: Some(Duration::ZERO),
                ..Default::default()
            },
        }
    }

    fn index_at(updated_at: i64, blocks: Vec<data_types::Block>) -> BucketIndex {
        BucketIndex {
            updated_at: Timestamp::new(updated_at),
            blocks,
            deletion_marks: vec![],
        }
    }

    #[tokio::test]
    async fn serves_blocks_and_caches_within_sync_interval() {
        let t = TestFinder::new(test_config());
        let tenant = tenant("t1");

        t.writer
            .write_index(&tenant, &index_at(0, vec![block(1, 0, 100), block(2, 50, 150)]))
            .await
            .unwrap();

        let got = t
            .finder
            .get_blocks(&tenant, Timestamp::new(0), Timestamp::new(200))
            .await
            .unwrap();
        assert_eq!(
            got.block_ids(),
            vec![BlockId::from_u128(2), BlockId::from_u128(1)]
        );
        assert_eq!(t.load_counter("success"), 1);

        // a newer index appears, but the cached copy is still fresh
        t.writer
            .write_index(&tenant, &index_at(1_000, vec![block(3, 0, 100)]))
            .await
            .unwrap();
        let got = t
            .finder
            .get_blocks(&tenant, Timestamp::new(0), Timestamp::new(200))
            .await
            .unwrap();
        assert_eq!(got.blocks.len(), 2);
        assert_eq!(t.load_counter("success"), 1);

        // past the sync interval the refresh picks it up
        t.time_provider.inc(Duration::from_secs(61));
        let got = t
            .finder
            .get_blocks(&tenant, Timestamp::new(0), Timestamp::new(200))
            .await
            .unwrap();
        assert_eq!(got.block_ids(), vec![BlockId::from_u128(3)]);
        assert_eq!(t.load_counter("success"), 2);
    }

    #[tokio::test]
    async fn missing_index_is_an_empty_tenant() {
        let t = TestFinder::new(test_config());
        let got = t
            .finder
            .get_blocks(&tenant("nobody"), Timestamp::new(0), Timestamp::new(100))
            .await
            .unwrap();
        assert!(got.blocks.is_empty());
        assert!(got.deletion_marks.is_empty());
    }

    #[tokio::test]
    async fn corrupt_index_without_cache_is_an_error() {
        let t = TestFinder::new(test_config());
        let tenant = tenant("t1");

        t.store
            .put(
                &Path::from(format!("{tenant}/{INDEX_OBJECT_NAME}")),
                Bytes::from_static(b"not json"),
            )
            .await
            .unwrap();

        let err = t
            .finder
            .get_blocks(&tenant, Timestamp::new(0), Timestamp::new(100))
            .await
            .unwrap_err();
        assert!(matches!(err, BlockFinderError::Corrupt { .. }), "{err}");
        assert_eq!(t.load_counter("failure"), 1);
    }

    #[tokio::test]
    async fn refresh_failure_serves_cached_until_stale_bound() {
        let t = TestFinder::new(test_config());
        let tenant = tenant("t1");

        t.writer
            .write_index(&tenant, &index_at(0, vec![block(1, 0, 100)]))
            .await
            .unwrap();
        t.finder
            .get_blocks(&tenant, Timestamp::new(0), Timestamp::new(100))
            .await
            .unwrap();

        // the producer starts writing garbage
        t.store
            .put(
                &Path::from(format!("{tenant}/{INDEX_OBJECT_NAME}")),
                Bytes::from_static(b"not json"),
            )
            .await
            .unwrap();

        // refresh fails, but the cached copy is within the stale tolerance
        t.time_provider.inc(Duration::from_secs(120));
        let got = t
            .finder
            .get_blocks(&tenant, Timestamp::new(0), Timestamp::new(100))
            .await
            .unwrap();
        assert_eq!(got.blocks.len(), 1);
        assert_eq!(t.load_counter("failure"), 1);

        // beyond the stale bound the finder refuses
        t.time_provider.inc(Duration::from_secs(601));
        let err = t
            .finder
            .get_blocks(&tenant, Timestamp::new(0), Timestamp::new(100))
            .await
            .unwrap_err();
        assert!(matches!(err, BlockFinderError::IndexStale { .. }), "{err}");
    }

    #[tokio::test]
    async fn stale_producer_is_refused_even_when_readable() {
        let t = TestFinder::new(test_config());
        let tenant = tenant("t1");

        // index object readable, but its updated_at is far in the past
        t.time_provider.set(Time::from_timestamp_millis(1_000_000));
        t.writer
            .write_index(&tenant, &index_at(0, vec![block(1, 0, 100)]))
            .await
            .unwrap();

        let err = t
            .finder
            .get_blocks(&tenant, Timestamp::new(0), Timestamp::new(100))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BlockFinderError::IndexStale {
                last_refresh: Some(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn idle_tenants_are_evicted() {
        let t = TestFinder::new(test_config());
        let tenant = tenant("t1");

        t.writer
            .write_index(&tenant, &index_at(0, vec![block(1, 0, 100)]))
            .await
            .unwrap();
        t.finder
            .get_blocks(&tenant, Timestamp::new(0), Timestamp::new(100))
            .await
            .unwrap();

        let gauge: Metric<U64Gauge> = t
            .registry
            .get_instrument("bucket_index_loaded_tenants")
            .unwrap();
        let gauge = gauge
            .get_observer(&Attributes::from(&[("variant", "pull")]))
            .unwrap();
        assert_eq!(gauge.fetch(), 1);

        // not yet idle
        t.time_provider.inc(Duration::from_secs(1800));
        t.finder.evict_idle_tenants();
        assert_eq!(gauge.fetch(), 1);

        t.time_provider.inc(Duration::from_secs(3601));
        t.finder.evict_idle_tenants();
        assert_eq!(gauge.fetch(), 0);
    }
}
