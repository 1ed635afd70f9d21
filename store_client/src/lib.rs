//! Client surface of the store-gateway replicas.
//!
//! The coordinator talks to replicas through [`StoreGatewayClient`], a thin
//! abstraction over the three streaming RPCs. Real deployments back this with
//! a gRPC connection pool; this crate specifies the contract and ships the
//! [`mock`] implementation the query-path tests are built on.
//!
//! Requests always carry the tenant and the exact set of blocks the replica
//! is expected to consult. Replicas run with an abort-on-partial-response
//! strategy: a block they cannot serve is simply absent from the hints frame,
//! never silently skipped mid-series.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod mock;

use async_trait::async_trait;
use bytes::Bytes;
use data_types::{BlockId, LabelMatcher, LabelSet, ReplicaAddr, TenantId, Timestamp};
use futures::stream::BoxStream;
use std::fmt::Debug;

/// Generic boxed error with a coarse kind, so callers can decide about
/// retries without knowing transport details.
#[derive(Debug)]
pub struct StoreClientError {
    inner: Box<dyn std::error::Error + Sync + Send>,
    kind: StoreClientErrorKind,
}

impl StoreClientError {
    /// Create an error of `kind`.
    pub fn new(
        kind: StoreClientErrorKind,
        e: impl Into<Box<dyn std::error::Error + Sync + Send>>,
    ) -> Self {
        Self {
            inner: e.into(),
            kind,
        }
    }

    /// The replica cannot be reached or refused the stream.
    pub fn unavailable(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(StoreClientErrorKind::Unavailable, e)
    }

    /// The stream failed after it was opened.
    pub fn stream(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(StoreClientErrorKind::Stream, e)
    }

    /// The replica rejected the query because a per-query resource limit
    /// was hit on its side.
    pub fn resource_exhausted(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(StoreClientErrorKind::ResourceExhausted, e)
    }

    /// Anything else.
    pub fn internal(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(StoreClientErrorKind::Internal, e)
    }

    /// Returns the kind of error this was.
    pub fn kind(&self) -> StoreClientErrorKind {
        self.kind
    }

    /// Whether the failed blocks may be retried against another replica.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            StoreClientErrorKind::Unavailable | StoreClientErrorKind::Stream
        )
    }
}

impl std::fmt::Display for StoreClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StoreClientError({:?}): {}", self.kind, self.inner)
    }
}

impl std::error::Error for StoreClientError {}

/// Coarse classification of [`StoreClientError`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StoreClientErrorKind {
    /// Opening the connection or the stream failed.
    Unavailable,
    /// The stream broke after being opened.
    Stream,
    /// The replica enforced one of its own per-query limits.
    ResourceExhausted,
    /// Unclassified failure.
    Internal,
}

/// An opaque, still-encoded chunk of series samples.
///
/// Chunks are passed through end to end; sample-level processing happens in
/// layers above the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesChunk {
    /// Minimum sample timestamp in the chunk, inclusive.
    pub min_time: Timestamp,
    /// Maximum sample timestamp in the chunk, inclusive.
    pub max_time: Timestamp,
    /// Encoded chunk payload.
    pub raw: Bytes,
}

impl SeriesChunk {
    /// Size of the encoded payload in bytes.
    pub fn size(&self) -> usize {
        self.raw.len()
    }
}

/// One series with its chunks as sent by a replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamedSeries {
    /// The series' complete label set.
    pub labels: LabelSet,
    /// Chunks covering the requested range, in time order.
    pub chunks: Vec<SeriesChunk>,
}

/// One frame of a `Series` stream.
///
/// The stream multiplexes payload, non-fatal warnings and the hints telling
/// the coordinator which blocks this replica actually consulted. Hints are
/// authoritative for the consistency check; the request's block assignment
/// is not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeriesFrame {
    /// A series with chunk payloads.
    Series(StreamedSeries),
    /// A non-fatal warning to surface to the caller.
    Warning(String),
    /// The blocks this replica consulted for the query.
    Hints {
        /// Blocks actually consulted.
        queried_blocks: Vec<BlockId>,
    },
}

/// Parameters of a `Series` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesRequest {
    /// Tenant the query is scoped to; carried as request metadata.
    pub tenant: TenantId,
    /// Start of the queried range, inclusive.
    pub min_time: Timestamp,
    /// End of the queried range, inclusive.
    pub max_time: Timestamp,
    /// Series selector.
    pub matchers: Vec<LabelMatcher>,
    /// Only consult these blocks.
    pub block_ids: Vec<BlockId>,
    /// Elide chunk payloads (label-only queries).
    pub skip_chunks: bool,
    /// Remaining chunk budget of the overall query, `0` when unlimited.
    /// Replicas abort with a resource-exhausted error once they would exceed
    /// it.
    pub chunks_limit: u64,
}

/// Parameters of a `LabelNames` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelNamesRequest {
    /// Tenant the query is scoped to.
    pub tenant: TenantId,
    /// Start of the queried range, inclusive.
    pub min_time: Timestamp,
    /// End of the queried range, inclusive.
    pub max_time: Timestamp,
    /// Optional selector restricting the series considered.
    pub matchers: Vec<LabelMatcher>,
    /// Only consult these blocks.
    pub block_ids: Vec<BlockId>,
}

/// Parameters of a `LabelValues` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelValuesRequest {
    /// Tenant the query is scoped to.
    pub tenant: TenantId,
    /// Start of the queried range, inclusive.
    pub min_time: Timestamp,
    /// End of the queried range, inclusive.
    pub max_time: Timestamp,
    /// The label whose values are enumerated.
    pub label: String,
    /// Optional selector restricting the series considered.
    pub matchers: Vec<LabelMatcher>,
    /// Only consult these blocks.
    pub block_ids: Vec<BlockId>,
}

/// Result of a `LabelNames` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelNamesResponse {
    /// Label names, sorted and de-duplicated per replica.
    pub names: Vec<String>,
    /// Non-fatal warnings.
    pub warnings: Vec<String>,
    /// Blocks actually consulted.
    pub queried_blocks: Vec<BlockId>,
}

/// Result of a `LabelValues` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelValuesResponse {
    /// Label values, sorted and de-duplicated per replica.
    pub values: Vec<String>,
    /// Non-fatal warnings.
    pub warnings: Vec<String>,
    /// Blocks actually consulted.
    pub queried_blocks: Vec<BlockId>,
}

/// The stream returned by [`StoreGatewayClient::series`].
pub type SeriesFrameStream = BoxStream<'static, Result<SeriesFrame, StoreClientError>>;

/// A connection to one store-gateway replica.
#[async_trait]
pub trait StoreGatewayClient: Debug + Send + Sync + 'static {
    /// The replica this client talks to.
    fn addr(&self) -> &ReplicaAddr;

    /// Open a series stream. The returned stream yields frames until
    /// end-of-stream; warnings are interleaved and the hints frame may arrive
    /// at any position.
    async fn series(&self, request: SeriesRequest) -> Result<SeriesFrameStream, StoreClientError>;

    /// Enumerate label names over the requested blocks.
    async fn label_names(
        &self,
        request: LabelNamesRequest,
    ) -> Result<LabelNamesResponse, StoreClientError>;

    /// Enumerate values of one label over the requested blocks.
    async fn label_values(
        &self,
        request: LabelValuesRequest,
    ) -> Result<LabelValuesResponse, StoreClientError>;
}

/// A process-wide, internally thread-safe source of replica clients.
///
/// Implementations own connection lifecycle (dialing, reuse, teardown); the
/// coordinator acquires clients per attempt and never holds them beyond a
/// request.
#[async_trait]
pub trait StoreClientPool: Debug + Send + Sync + 'static {
    /// The client for `addr`.
    async fn client_for(
        &self,
        addr: &ReplicaAddr,
    ) -> Result<std::sync::Arc<dyn StoreGatewayClient>, StoreClientError>;
}
