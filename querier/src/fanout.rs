//! The fan-out query coordinator.
//!
//! One request runs at most one *attempt* at a time; within an attempt one
//! task per selected replica streams frames concurrently. Tasks share a
//! cancellation token (first fatal error cancels the siblings) and append
//! finished batches to an accumulator guarded by a mutex held only across
//! the append. After every attempt the replicas' hints are reconciled
//! against the expected blocks; the residual is retried against replicas not
//! yet tried for those blocks.

use crate::{
    consistency::BlockConsistencyChecker,
    limits::{LimitError, QueryLimiter, QueryLimits},
    merge::{merge_series, merge_string_sets},
    metrics::QuerierMetrics,
    replica_selection::{BlockReplicaSelection, SelectionError},
    sharding::filter_blocks_by_shard,
    tenant_limits::TenantLimits,
};
use bucket_index::{BlockFinder, BlockFinderError, BlocksForRange};
use data_types::{
    BlockId, LabelMatcher, ReplicaAddr, ShardSelector, TenantId, Timestamp,
};
use futures::StreamExt;
use observability_deps::tracing::{debug, info, warn};
use parking_lot::Mutex;
use snafu::{ResultExt, Snafu};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use store_client::{
    LabelNamesRequest, LabelValuesRequest, SeriesFrame, SeriesRequest, StoreClientError,
    StoreClientErrorKind, StoreGatewayClient, StreamedSeries,
};
use tephra_time::TimeProvider;
use tokio_util::sync::CancellationToken;

/// Configuration of the [`BlockStoreQuerier`].
#[derive(Debug, Clone, Copy)]
pub struct BlockStoreQuerierConfig {
    /// How many selection/fan-out/consistency rounds to run before giving
    /// up on missing blocks.
    pub max_attempts: usize,

    /// Do not query the block store for data newer than this; that window
    /// is owned by the write path. `None` disables the clamp.
    pub query_store_after: Option<Duration>,

    /// Process-wide per-query resource limits.
    pub limits: QueryLimits,
}

impl Default for BlockStoreQuerierConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            query_store_after: None,
            limits: QueryLimits::default(),
        }
    }
}

/// Failure vocabulary of the query surface.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum QueryError {
    #[snafu(display("cannot resolve blocks for the query: {}", source))]
    Blocks { source: BlockFinderError },

    #[snafu(display("{}", source))]
    LimitExceeded { source: LimitError },

    #[snafu(display("store-gateway {} rejected the query: {}", addr, source))]
    ResourceExhausted {
        addr: ReplicaAddr,
        source: StoreClientError,
    },

    #[snafu(display("cannot select store-gateway replicas: {}", source))]
    Selection { source: SelectionError },

    #[snafu(display(
        "the consistency check failed: {} expected blocks were not queried: {}",
        block_ids.len(),
        join_ids(block_ids)
    ))]
    ConsistencyCheckFailed { block_ids: Vec<BlockId> },

    #[snafu(display("the query was cancelled"))]
    Cancelled,

    #[snafu(display("invalid query shard selector: {}", source))]
    InvalidShard { source: data_types::Error },

    #[snafu(display("internal error: {}", message))]
    Internal { message: String },
}

fn join_ids(ids: &[BlockId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Bookkeeping surfaced with every successful query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryStats {
    /// Distinct store-gateway replicas that served data.
    pub stores_hit: u64,
    /// Consistency-driven refetch rounds (`final attempt - 1`).
    pub refetches: u64,
}

/// Result of a series query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeriesResult {
    /// Merged series, sorted by labels, each label set exactly once.
    pub series: Vec<StreamedSeries>,
    /// Non-fatal warnings from the replicas.
    pub warnings: Vec<String>,
    /// Query statistics.
    pub stats: QueryStats,
}

/// Result of a label-names or label-values query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelsResult {
    /// Sorted, de-duplicated names or values.
    pub values: Vec<String>,
    /// Non-fatal warnings from the replicas.
    pub warnings: Vec<String>,
    /// Query statistics.
    pub stats: QueryStats,
}

/// What kind of label query a fan-out round runs.
#[derive(Debug, Clone)]
enum LabelLeaf {
    Names,
    Values(String),
}

#[derive(Debug)]
enum TaskFailure {
    Limit(LimitError),
    Replica {
        addr: ReplicaAddr,
        source: StoreClientError,
    },
    Internal {
        message: String,
    },
}

impl From<TaskFailure> for QueryError {
    fn from(f: TaskFailure) -> Self {
        match f {
            TaskFailure::Limit(source) => Self::LimitExceeded { source },
            TaskFailure::Replica { addr, source } => Self::ResourceExhausted { addr, source },
            TaskFailure::Internal { message } => Self::Internal { message },
        }
    }
}

#[derive(Debug, Default)]
struct SeriesAcc {
    per_replica: Vec<(ReplicaAddr, Vec<StreamedSeries>)>,
    warnings: Vec<String>,
    queried: HashSet<BlockId>,
    stores: HashSet<ReplicaAddr>,
}

#[derive(Debug, Default)]
struct LabelsAcc {
    sets: Vec<Vec<String>>,
    warnings: Vec<String>,
    queried: HashSet<BlockId>,
    stores: HashSet<ReplicaAddr>,
}

/// Orchestrates consistency-checked, limit-enforced fan-out reads over the
/// block store.
///
/// The block finder, the replica selection and the client pool are injected;
/// the querier owns no background work and keeps no state across requests.
#[derive(Debug)]
pub struct BlockStoreQuerier {
    finder: Arc<dyn BlockFinder>,
    selection: Arc<dyn BlockReplicaSelection>,
    checker: BlockConsistencyChecker,
    tenant_limits: Arc<dyn TenantLimits>,
    config: BlockStoreQuerierConfig,
    time_provider: Arc<dyn TimeProvider>,
    metrics: QuerierMetrics,
}

impl BlockStoreQuerier {
    /// Create a querier.
    pub fn new(
        finder: Arc<dyn BlockFinder>,
        selection: Arc<dyn BlockReplicaSelection>,
        checker: BlockConsistencyChecker,
        tenant_limits: Arc<dyn TenantLimits>,
        config: BlockStoreQuerierConfig,
        time_provider: Arc<dyn TimeProvider>,
        metric_registry: &metric::Registry,
    ) -> Self {
        Self {
            finder,
            selection,
            checker,
            tenant_limits,
            config,
            time_provider,
            metrics: QuerierMetrics::new(metric_registry),
        }
    }

    /// Query series with chunks over `[min_t, max_t]`.
    ///
    /// The shard selector, if any, is carried via the reserved
    /// `__query_shard__` matcher and stripped before replicas see the
    /// selector.
    pub async fn series(
        &self,
        tenant: &TenantId,
        min_t: Timestamp,
        max_t: Timestamp,
        matchers: Vec<LabelMatcher>,
        cancel: &CancellationToken,
    ) -> Result<SeriesResult, QueryError> {
        let (shard, matchers) =
            ShardSelector::from_matchers(&matchers).context(InvalidShardSnafu)?;

        let (min_t, max_t) = match self.clamp_max_time(min_t, max_t) {
            Some(range) => range,
            None => return Ok(SeriesResult::default()),
        };

        let expected = self.expected_blocks(tenant, min_t, max_t, shard).await?;
        if expected.blocks.is_empty() {
            return Ok(SeriesResult::default());
        }

        let tenant_max_chunks = self.tenant_limits.max_chunks_per_query(tenant);
        let mut limits = self.config.limits;
        limits.max_chunks = combine_limits(limits.max_chunks, tenant_max_chunks);
        let limiter = Arc::new(QueryLimiter::new(limits));

        let shard_size = self.tenant_limits.store_gateway_tenant_shard_size(tenant);
        let acc: Arc<Mutex<SeriesAcc>> = Default::default();

        let stats = self
            .run_attempts(tenant, &expected, shard_size, cancel, |round| {
                let client = Arc::clone(&round.client);
                let request = SeriesRequest {
                    tenant: tenant.clone(),
                    min_time: min_t,
                    max_time: max_t,
                    matchers: matchers.clone(),
                    block_ids: round.blocks.clone(),
                    skip_chunks: false,
                    chunks_limit: chunk_budget(tenant_max_chunks, &limiter),
                };
                let limiter = Arc::clone(&limiter);
                let acc = Arc::clone(&acc);
                let token = round.token;
                let assigned: HashSet<BlockId> = round.blocks.iter().copied().collect();

                async move {
                    let addr = client.addr().clone();
                    let mut stream = match client.series(request).await {
                        Ok(stream) => stream,
                        Err(e) => return open_failure(addr, e, &token),
                    };

                    let mut local_series = vec![];
                    let mut local_warnings = vec![];
                    let mut local_hints = vec![];
                    loop {
                        let frame = tokio::select! {
                            _ = token.cancelled() => return Ok(()),
                            frame = stream.next() => frame,
                        };
                        match frame {
                            None => break,
                            Some(Ok(SeriesFrame::Series(series))) => {
                                let accounted = limiter
                                    .add_series(series.labels.fingerprint())
                                    .and_then(|_| {
                                        limiter.add_chunks(
                                            series.chunks.len() as u64,
                                            series.chunks.iter().map(|c| c.size() as u64).sum(),
                                        )
                                    });
                                if let Err(limit) = accounted {
                                    token.cancel();
                                    return Err(TaskFailure::Limit(limit));
                                }
                                local_series.push(series);
                            }
                            Some(Ok(SeriesFrame::Warning(warning))) => {
                                local_warnings.push(warning)
                            }
                            Some(Ok(SeriesFrame::Hints { queried_blocks })) => {
                                if let Err(f) = validate_hints(&addr, &assigned, &queried_blocks) {
                                    token.cancel();
                                    return Err(f);
                                }
                                local_hints.extend(queried_blocks);
                            }
                            Some(Err(e)) if !e.is_retryable() => {
                                token.cancel();
                                return Err(TaskFailure::Replica { addr, source: e });
                            }
                            Some(Err(e)) => {
                                // transient mid-stream failure: this
                                // replica's partial output is discarded, its
                                // blocks stay un-hinted and get retried
                                warn!(%addr, %e, "store-gateway stream failed, discarding partial results");
                                return Ok(());
                            }
                        }
                    }

                    let mut acc = acc.lock();
                    acc.stores.insert(addr.clone());
                    acc.per_replica.push((addr, local_series));
                    acc.warnings.extend(local_warnings);
                    acc.queried.extend(local_hints);
                    Ok(())
                }
            },
            {
                let acc = Arc::clone(&acc);
                move || acc.lock().queried.clone()
            },
            {
                let acc = Arc::clone(&acc);
                move || acc.lock().stores.len() as u64
            })
            .await?;

        let mut acc = std::mem::take(&mut *acc.lock());
        Ok(SeriesResult {
            series: merge_series(std::mem::take(&mut acc.per_replica)),
            warnings: acc.warnings,
            stats,
        })
    }

    /// Enumerate label names over `[min_t, max_t]`.
    pub async fn label_names(
        &self,
        tenant: &TenantId,
        min_t: Timestamp,
        max_t: Timestamp,
        matchers: Vec<LabelMatcher>,
        cancel: &CancellationToken,
    ) -> Result<LabelsResult, QueryError> {
        self.label_query(tenant, min_t, max_t, matchers, LabelLeaf::Names, cancel)
            .await
    }

    /// Enumerate the values of `label` over `[min_t, max_t]`.
    pub async fn label_values(
        &self,
        tenant: &TenantId,
        label: impl Into<String>,
        min_t: Timestamp,
        max_t: Timestamp,
        matchers: Vec<LabelMatcher>,
        cancel: &CancellationToken,
    ) -> Result<LabelsResult, QueryError> {
        self.label_query(
            tenant,
            min_t,
            max_t,
            matchers,
            LabelLeaf::Values(label.into()),
            cancel,
        )
        .await
    }

    async fn label_query(
        &self,
        tenant: &TenantId,
        min_t: Timestamp,
        max_t: Timestamp,
        matchers: Vec<LabelMatcher>,
        leaf: LabelLeaf,
        cancel: &CancellationToken,
    ) -> Result<LabelsResult, QueryError> {
        let (shard, matchers) =
            ShardSelector::from_matchers(&matchers).context(InvalidShardSnafu)?;

        let (min_t, max_t) = match self.clamp_max_time(min_t, max_t) {
            Some(range) => range,
            None => return Ok(LabelsResult::default()),
        };
        // clamp the window to the tenant's maximum label-query length,
        // keeping it anchored at max_t
        let min_t = match self.tenant_limits.max_labels_query_length(tenant) {
            Some(max_len) => {
                let lower = Timestamp::new(max_t.get() - max_len.as_millis() as i64);
                min_t.max(lower)
            }
            None => min_t,
        };

        let expected = self.expected_blocks(tenant, min_t, max_t, shard).await?;
        if expected.blocks.is_empty() {
            return Ok(LabelsResult::default());
        }

        let shard_size = self.tenant_limits.store_gateway_tenant_shard_size(tenant);
        let acc: Arc<Mutex<LabelsAcc>> = Default::default();

        let stats = self
            .run_attempts(tenant, &expected, shard_size, cancel, |round| {
                let client = Arc::clone(&round.client);
                let leaf = leaf.clone();
                let tenant = tenant.clone();
                let matchers = matchers.clone();
                let blocks = round.blocks.clone();
                let acc = Arc::clone(&acc);
                let token = round.token;

                async move {
                    let addr = client.addr().clone();
                    let assigned: HashSet<BlockId> = blocks.iter().copied().collect();

                    let response = tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        response = call_label_leaf(
                            &*client, leaf, tenant, min_t, max_t, matchers, blocks,
                        ) => response,
                    };

                    let (values, warnings, queried_blocks) = match response {
                        Ok(parts) => parts,
                        Err(e) => return open_failure(addr, e, &token),
                    };
                    if let Err(f) = validate_hints(&addr, &assigned, &queried_blocks) {
                        token.cancel();
                        return Err(f);
                    }

                    let mut acc = acc.lock();
                    acc.stores.insert(addr);
                    acc.sets.push(values);
                    acc.warnings.extend(warnings);
                    acc.queried.extend(queried_blocks);
                    Ok(())
                }
            },
            {
                let acc = Arc::clone(&acc);
                move || acc.lock().queried.clone()
            },
            {
                let acc = Arc::clone(&acc);
                move || acc.lock().stores.len() as u64
            })
            .await?;

        let mut acc = std::mem::take(&mut *acc.lock());
        Ok(LabelsResult {
            values: merge_string_sets(std::mem::take(&mut acc.sets)),
            warnings: acc.warnings,
            stats,
        })
    }

    /// Clamp `max_t` away from the window owned by the write path.
    /// `None` means the whole query range is recent: nothing to do here.
    fn clamp_max_time(
        &self,
        min_t: Timestamp,
        max_t: Timestamp,
    ) -> Option<(Timestamp, Timestamp)> {
        let max_t = match self.config.query_store_after {
            Some(query_store_after) => {
                let now = self.time_provider.now();
                let bound =
                    Timestamp::new((now - query_store_after).timestamp_millis());
                max_t.min(bound)
            }
            None => max_t,
        };
        if max_t < min_t {
            debug!("query range is entirely within the write-path window, skipping block store");
            return None;
        }
        Some((min_t, max_t))
    }

    /// Resolve the expected block set: catalog lookup, deletion-mark
    /// exclusion, shard filter.
    async fn expected_blocks(
        &self,
        tenant: &TenantId,
        min_t: Timestamp,
        max_t: Timestamp,
        shard: Option<ShardSelector>,
    ) -> Result<BlocksForRange, QueryError> {
        let found = self
            .finder
            .get_blocks(tenant, min_t, max_t)
            .await
            .context(BlocksSnafu)?;

        let blocks = self
            .checker
            .exclude_marked_for_deletion(found.blocks, &found.deletion_marks);

        let blocks = match shard {
            Some(selector) => {
                let (kept, incompatible) = filter_blocks_by_shard(blocks, selector);
                self.metrics
                    .shard_incompatible_blocks
                    .inc(incompatible as u64);
                kept
            }
            None => blocks,
        };

        debug!(
            %tenant,
            %min_t,
            %max_t,
            n_expected = blocks.len(),
            "resolved expected blocks"
        );
        Ok(BlocksForRange {
            blocks,
            deletion_marks: found.deletion_marks,
        })
    }

    /// The attempt loop shared by all three entry points.
    ///
    /// `spawn_leaf` builds one leaf future per `(client, blocks)` assignment;
    /// leaves account their own payload into the caller's accumulator and
    /// report only fatal failures. `queried_so_far` and `stores_hit` read
    /// the hint and replica bookkeeping back out of that accumulator for the
    /// consistency decision and the metrics.
    async fn run_attempts<L, F, Q, S>(
        &self,
        tenant: &TenantId,
        expected: &BlocksForRange,
        shard_size: usize,
        cancel: &CancellationToken,
        mut spawn_leaf: L,
        queried_so_far: Q,
        stores_hit: S,
    ) -> Result<QueryStats, QueryError>
    where
        L: FnMut(LeafRound) -> F,
        F: std::future::Future<Output = Result<(), TaskFailure>> + Send + 'static,
        Q: Fn() -> HashSet<BlockId>,
        S: Fn() -> u64,
    {
        let mut remaining: Vec<BlockId> = expected.blocks.iter().map(|b| b.id).collect();
        let mut attempted: HashMap<BlockId, Vec<ReplicaAddr>> = HashMap::new();

        let mut attempts_run = 0;
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(QueryError::Cancelled);
            }
            if attempt > self.config.max_attempts {
                break;
            }

            let clients = match self
                .selection
                .clients_for(tenant, &remaining, &attempted, shard_size)
                .await
            {
                Ok(clients) => clients,
                Err(e) if attempt == 1 => return Err(QueryError::Selection { source: e }),
                Err(e) => {
                    // later attempts: keep what we have and let the final
                    // consistency decision speak
                    info!(
                        %tenant,
                        attempt,
                        %e,
                        "replica selection failed on retry, evaluating collected results"
                    );
                    break;
                }
            };

            let token = cancel.child_token();
            let mut assignments = Vec::with_capacity(clients.len());
            let mut handles = Vec::with_capacity(clients.len());
            for (client, blocks) in clients {
                assignments.push((client.addr().clone(), blocks.clone()));
                handles.push(tokio::spawn(spawn_leaf(LeafRound {
                    client,
                    blocks,
                    token: token.clone(),
                })));
            }

            let results = futures::future::join_all(handles).await;
            attempts_run += 1;

            // the exclusion map tracks *attempted*, not served
            for (addr, blocks) in assignments {
                for block in blocks {
                    attempted.entry(block).or_default().push(addr.clone());
                }
            }

            if cancel.is_cancelled() {
                return Err(QueryError::Cancelled);
            }
            for result in results {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(failure)) => return Err(failure.into()),
                    Err(e) => {
                        return Err(QueryError::Internal {
                            message: format!("fan-out task panicked: {e}"),
                        })
                    }
                }
            }

            let missing =
                self.checker
                    .check(&expected.blocks, &expected.deletion_marks, &queried_so_far());
            if missing.is_empty() {
                return Ok(self.record_success(attempts_run, stores_hit()));
            }

            debug!(
                %tenant,
                attempt,
                n_missing = missing.len(),
                "consistency residual, retrying against other replicas"
            );
            remaining = missing;
            attempt += 1;
        }

        // selection failed mid-way or attempts are exhausted: one final
        // consistency decision over everything collected so far
        let missing =
            self.checker
                .check(&expected.blocks, &expected.deletion_marks, &queried_so_far());
        if missing.is_empty() {
            return Ok(self.record_success(attempts_run, stores_hit()));
        }

        self.metrics.consistency_check_failures.inc(1);
        Err(QueryError::ConsistencyCheckFailed { block_ids: missing })
    }

    fn record_success(&self, attempts_run: usize, stores_hit: u64) -> QueryStats {
        let refetches = attempts_run.saturating_sub(1) as u64;
        self.metrics.stores_hit.record(stores_hit);
        self.metrics.refetches.record(refetches);
        QueryStats {
            stores_hit,
            refetches,
        }
    }
}

/// One `(client, blocks)` assignment of an attempt.
struct LeafRound {
    client: Arc<dyn StoreGatewayClient>,
    blocks: Vec<BlockId>,
    token: CancellationToken,
}

fn combine_limits(a: u64, b: u64) -> u64 {
    match (a, b) {
        (0, b) => b,
        (a, 0) => a,
        (a, b) => a.min(b),
    }
}

/// Remaining chunk budget announced to the replicas of the next attempt.
fn chunk_budget(tenant_max_chunks: u64, limiter: &QueryLimiter) -> u64 {
    if tenant_max_chunks == 0 {
        return 0;
    }
    // never announce 0 (= unlimited); the limiter trips on the next chunk
    // anyway once the budget is truly gone
    tenant_max_chunks
        .saturating_sub(limiter.chunks_observed())
        .max(1)
}

fn open_failure(
    addr: ReplicaAddr,
    e: StoreClientError,
    token: &CancellationToken,
) -> Result<(), TaskFailure> {
    if e.kind() == StoreClientErrorKind::ResourceExhausted {
        token.cancel();
        return Err(TaskFailure::Replica { addr, source: e });
    }
    // the blocks stay un-hinted; the next attempt re-assigns them
    warn!(%addr, %e, "store-gateway unreachable for this attempt");
    Ok(())
}

fn validate_hints(
    addr: &ReplicaAddr,
    assigned: &HashSet<BlockId>,
    hinted: &[BlockId],
) -> Result<(), TaskFailure> {
    for block in hinted {
        if !assigned.contains(block) {
            return Err(TaskFailure::Internal {
                message: format!(
                    "store-gateway {addr} hinted block {block} it was never assigned"
                ),
            });
        }
    }
    Ok(())
}

async fn call_label_leaf(
    client: &dyn StoreGatewayClient,
    leaf: LabelLeaf,
    tenant: TenantId,
    min_t: Timestamp,
    max_t: Timestamp,
    matchers: Vec<LabelMatcher>,
    block_ids: Vec<BlockId>,
) -> Result<(Vec<String>, Vec<String>, Vec<BlockId>), StoreClientError> {
    match leaf {
        LabelLeaf::Names => {
            let response = client
                .label_names(LabelNamesRequest {
                    tenant,
                    min_time: min_t,
                    max_time: max_t,
                    matchers,
                    block_ids,
                })
                .await?;
            Ok((response.names, response.warnings, response.queried_blocks))
        }
        LabelLeaf::Values(label) => {
            let response = client
                .label_values(LabelValuesRequest {
                    tenant,
                    min_time: min_t,
                    max_time: max_t,
                    label,
                    matchers,
                    block_ids,
                })
                .await?;
            Ok((response.values, response.warnings, response.queried_blocks))
        }
    }
}
