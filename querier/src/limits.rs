//! Per-query resource accounting shared by all sub-query tasks.

use parking_lot::Mutex;
use std::{
    collections::HashSet,
    sync::atomic::{AtomicU64, Ordering},
};

/// Per-query resource limits. `0` disables the respective limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryLimits {
    /// Maximum number of distinct series, counted by label-set fingerprint.
    pub max_series: u64,
    /// Maximum total encoded chunk bytes.
    pub max_chunk_bytes: u64,
    /// Maximum number of chunks.
    pub max_chunks: u64,
}

/// Which limit was breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum LimitKind {
    Series,
    ChunkBytes,
    Chunks,
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Series => "series",
            Self::ChunkBytes => "chunk bytes",
            Self::Chunks => "chunks",
        };
        f.write_str(s)
    }
}

/// A breached per-query limit. Terminal for the whole request; never
/// retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitError {
    /// Which limit was breached.
    pub kind: LimitKind,
    /// The configured bound.
    pub limit: u64,
    /// The value observed when the bound broke.
    pub observed: u64,
}

impl std::fmt::Display for LimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "the query exceeded the maximum number of {} (limit: {}, observed: {})",
            self.kind, self.limit, self.observed
        )
    }
}

impl std::error::Error for LimitError {}

/// Atomic counters checked after every received series frame.
///
/// One limiter lives for the whole request, across attempts, so data
/// re-fetched after a partial failure still counts against the same budget.
/// Series are de-duplicated by fingerprint: the same series arriving from
/// two replicas counts once.
#[derive(Debug)]
pub struct QueryLimiter {
    limits: QueryLimits,
    series_fingerprints: Mutex<HashSet<u64>>,
    chunk_bytes: AtomicU64,
    chunks: AtomicU64,
}

impl QueryLimiter {
    /// Create a limiter enforcing `limits`.
    pub fn new(limits: QueryLimits) -> Self {
        Self {
            limits,
            series_fingerprints: Default::default(),
            chunk_bytes: AtomicU64::new(0),
            chunks: AtomicU64::new(0),
        }
    }

    /// Account one series by fingerprint.
    pub fn add_series(&self, fingerprint: u64) -> Result<(), LimitError> {
        let mut fingerprints = self.series_fingerprints.lock();
        fingerprints.insert(fingerprint);
        let observed = fingerprints.len() as u64;
        check(LimitKind::Series, self.limits.max_series, observed)
    }

    /// Account a batch of chunks.
    pub fn add_chunks(&self, count: u64, bytes: u64) -> Result<(), LimitError> {
        let chunks = self.chunks.fetch_add(count, Ordering::Relaxed) + count;
        check(LimitKind::Chunks, self.limits.max_chunks, chunks)?;

        let chunk_bytes = self.chunk_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        check(LimitKind::ChunkBytes, self.limits.max_chunk_bytes, chunk_bytes)
    }

    /// Chunks observed so far, across attempts.
    pub fn chunks_observed(&self) -> u64 {
        self.chunks.load(Ordering::Relaxed)
    }
}

fn check(kind: LimitKind, limit: u64, observed: u64) -> Result<(), LimitError> {
    if limit > 0 && observed > limit {
        return Err(LimitError {
            kind,
            limit,
            observed,
        });
    }
    Ok(())
}
