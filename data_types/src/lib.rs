//! Shared data types for the tephra query engine.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use snafu::{ensure, OptionExt, Snafu};
use std::{
    borrow::Borrow,
    collections::hash_map::DefaultHasher,
    fmt::Write as _,
    hash::{Hash, Hasher},
    ops::RangeInclusive,
    sync::Arc,
};
use uuid::Uuid;

/// Errors constructing or parsing the types in this crate.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("tenant id must not be empty"))]
    EmptyTenantId,

    #[snafu(display("invalid shard spec {:?}: expected \"<index>_of_<count>\"", spec))]
    MalformedShardSpec { spec: String },

    #[snafu(display("invalid shard spec {:?}: index must be < count and count >= 1", spec))]
    ShardIndexOutOfRange { spec: String },
}

/// Opaque identifier of a tenant. Non-empty by construction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TenantId(Arc<str>);

impl TenantId {
    /// Create a tenant ID, rejecting the empty string.
    pub fn new(id: impl AsRef<str>) -> Result<Self, Error> {
        let id = id.as_ref();
        ensure!(!id.is_empty(), EmptyTenantIdSnafu);
        Ok(Self(Arc::from(id)))
    }

    /// The tenant ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for TenantId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A millisecond timestamp. Time ranges on queries and blocks are inclusive
/// on both ends.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Create from milliseconds since the Unix epoch.
    pub fn new(millis: i64) -> Self {
        Self(millis)
    }

    /// Milliseconds since the Unix epoch.
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Sub<Timestamp> for Timestamp {
    type Output = i64;

    fn sub(self, rhs: Timestamp) -> Self::Output {
        self.0 - rhs.0
    }
}

/// The 128-bit identifier of an immutable block.
///
/// IDs order lexicographically by their raw bytes; block listings rely on
/// this for stable iteration.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct BlockId(Uuid);

impl BlockId {
    /// Wrap an existing UUID.
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Build from a raw 128-bit value. Mostly useful in tests.
    pub fn from_u128(v: u128) -> Self {
        Self(Uuid::from_u128(v))
    }

    /// The raw 128-bit value.
    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }

    /// The underlying UUID.
    pub fn get(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The shard a block was assigned during compaction, carried as `"i_of_n"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CompactorShardId {
    index: u32,
    of: u32,
}

impl CompactorShardId {
    /// Create a compactor shard ID with `index < of` and `of >= 1`.
    pub fn new(index: u32, of: u32) -> Result<Self, Error> {
        ensure!(
            of >= 1 && index < of,
            ShardIndexOutOfRangeSnafu {
                spec: format!("{index}_of_{of}")
            }
        );
        Ok(Self { index, of })
    }

    /// Zero-based shard index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Total shard count of the compaction split.
    pub fn of(&self) -> u32 {
        self.of
    }
}

impl std::str::FromStr for CompactorShardId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (index, of) = parse_shard_spec(s)?;
        let index = u32::try_from(index)
            .ok()
            .context(ShardIndexOutOfRangeSnafu { spec: s })?;
        let of = u32::try_from(of)
            .ok()
            .context(ShardIndexOutOfRangeSnafu { spec: s })?;
        Self::new(index, of)
    }
}

impl TryFrom<String> for CompactorShardId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<CompactorShardId> for String {
    fn from(id: CompactorShardId) -> Self {
        id.to_string()
    }
}

impl std::fmt::Display for CompactorShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_of_{}", self.index, self.of)
    }
}

/// Descriptor of an immutable block as listed by the block catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Block {
    /// Block identifier.
    pub id: BlockId,
    /// Minimum sample timestamp contained, inclusive.
    pub min_time: Timestamp,
    /// Maximum sample timestamp contained, inclusive.
    pub max_time: Timestamp,
    /// The compactor shard this block belongs to, if the compaction run was
    /// split.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compactor_shard: Option<CompactorShardId>,
    /// When the block was uploaded to object storage.
    pub uploaded_at: Timestamp,
}

impl Block {
    /// Whether this block covers any part of the inclusive `[min_t, max_t]`
    /// range.
    pub fn overlaps(&self, min_t: Timestamp, max_t: Timestamp) -> bool {
        self.max_time >= min_t && self.min_time <= max_t
    }
}

/// Tombstone marking a block for eventual deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeletionMark {
    /// The marked block.
    pub block_id: BlockId,
    /// When the mark was written.
    pub marked_at: Timestamp,
}

/// Opaque routable identifier of a store-gateway replica.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplicaAddr(Arc<str>);

impl ReplicaAddr {
    /// Wrap an address string.
    pub fn new(addr: impl AsRef<str>) -> Self {
        Self(Arc::from(addr.as_ref()))
    }

    /// The address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReplicaAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The reserved matcher label carrying the query shard selector.
pub const SHARD_LABEL: &str = "__query_shard__";

/// A runtime split of a query into `count` parallel sub-queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardSelector {
    index: u64,
    count: u64,
}

impl ShardSelector {
    /// Create a shard selector with `index < count` and `count >= 1`.
    pub fn new(index: u64, count: u64) -> Result<Self, Error> {
        ensure!(
            count >= 1 && index < count,
            ShardIndexOutOfRangeSnafu {
                spec: format!("{index}_of_{count}")
            }
        );
        Ok(Self { index, count })
    }

    /// Zero-based sub-query index.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Total sub-query count.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Extract the selector from the reserved [`SHARD_LABEL`] matcher.
    ///
    /// Returns the selector (if the reserved matcher is present) and the
    /// matchers with the reserved one stripped; replicas never see it.
    pub fn from_matchers(
        matchers: &[LabelMatcher],
    ) -> Result<(Option<Self>, Vec<LabelMatcher>), Error> {
        let mut selector = None;
        let mut remaining = Vec::with_capacity(matchers.len());
        for m in matchers {
            if m.name == SHARD_LABEL && m.op == MatchOp::Eq {
                selector = Some(m.value.parse::<Self>()?);
            } else {
                remaining.push(m.clone());
            }
        }
        Ok((selector, remaining))
    }
}

impl std::str::FromStr for ShardSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (index, count) = parse_shard_spec(s)?;
        Self::new(index, count)
    }
}

impl std::fmt::Display for ShardSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_of_{}", self.index, self.count)
    }
}

fn parse_shard_spec(s: &str) -> Result<(u64, u64), Error> {
    let (index, of) = s.split_once("_of_").context(MalformedShardSpecSnafu { spec: s })?;
    let index = index
        .parse::<u64>()
        .ok()
        .context(MalformedShardSpecSnafu { spec: s })?;
    let of = of
        .parse::<u64>()
        .ok()
        .context(MalformedShardSpecSnafu { spec: s })?;
    Ok((index, of))
}

/// One label name-value pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label {
    /// Label name.
    pub name: String,
    /// Label value.
    pub value: String,
}

impl Label {
    /// Create a label.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// The complete, name-sorted label set identifying one series.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LabelSet(Vec<Label>);

impl LabelSet {
    /// Build a label set, sorting by name (then value).
    pub fn new(mut labels: Vec<Label>) -> Self {
        labels.sort();
        Self(labels)
    }

    /// Iterate labels in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    /// Look up the value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    /// A 64-bit fingerprint of the label set, used to count distinct series
    /// without retaining them.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.0.hash(&mut hasher);
        hasher.finish()
    }
}

impl std::fmt::Display for LabelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_char('{')?;
        for (i, l) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={:?}", l.name, l.value)?;
        }
        f.write_char('}')
    }
}

/// Matcher operators supported on the query surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum MatchOp {
    Eq,
    NotEq,
    Regex,
    NotRegex,
}

impl std::fmt::Display for MatchOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Eq => "=",
            Self::NotEq => "!=",
            Self::Regex => "=~",
            Self::NotRegex => "!~",
        };
        f.write_str(s)
    }
}

/// A single label matcher of a series selector.
///
/// Matchers are carried opaquely; evaluation happens on the replicas.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LabelMatcher {
    /// Label name matched against.
    pub name: String,
    /// Matcher operator.
    pub op: MatchOp,
    /// Right-hand side value or pattern.
    pub value: String,
}

impl LabelMatcher {
    /// Create an equality matcher.
    pub fn eq(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: MatchOp::Eq,
            value: value.into(),
        }
    }

    /// Create a regex matcher.
    pub fn regex(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: MatchOp::Regex,
            value: value.into(),
        }
    }
}

impl std::fmt::Display for LabelMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.op, self.value)
    }
}

/// An inclusive millisecond time range.
pub type TimeRange = RangeInclusive<Timestamp>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_id_rejects_empty() {
        assert!(matches!(TenantId::new(""), Err(Error::EmptyTenantId)));
        assert_eq!(TenantId::new("team-a").unwrap().as_str(), "team-a");
    }

    #[test]
    fn block_id_orders_lexicographically() {
        let a = BlockId::from_u128(1);
        let b = BlockId::from_u128(2);
        assert!(a < b);
        assert_eq!(a.as_u128(), 1);
    }

    #[test]
    fn compactor_shard_round_trip() {
        let id: CompactorShardId = "1_of_4".parse().unwrap();
        assert_eq!(id.index(), 1);
        assert_eq!(id.of(), 4);
        assert_eq!(id.to_string(), "1_of_4");

        assert!("4_of_4".parse::<CompactorShardId>().is_err());
        assert!("0_of_0".parse::<CompactorShardId>().is_err());
        assert!("1-of-4".parse::<CompactorShardId>().is_err());
        assert!("a_of_4".parse::<CompactorShardId>().is_err());
    }

    #[test]
    fn compactor_shard_serde_as_string() {
        let id: CompactorShardId = "2_of_8".parse().unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"2_of_8\"");
        let back: CompactorShardId = serde_json::from_str("\"2_of_8\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn block_overlap_is_inclusive() {
        let block = Block {
            id: BlockId::from_u128(1),
            min_time: Timestamp::new(100),
            max_time: Timestamp::new(200),
            compactor_shard: None,
            uploaded_at: Timestamp::new(0),
        };

        assert!(block.overlaps(Timestamp::new(200), Timestamp::new(300)));
        assert!(block.overlaps(Timestamp::new(0), Timestamp::new(100)));
        assert!(block.overlaps(Timestamp::new(150), Timestamp::new(160)));
        assert!(!block.overlaps(Timestamp::new(201), Timestamp::new(300)));
        assert!(!block.overlaps(Timestamp::new(0), Timestamp::new(99)));
    }

    #[test]
    fn shard_selector_from_matchers() {
        let matchers = vec![
            LabelMatcher::eq("job", "api"),
            LabelMatcher::eq(SHARD_LABEL, "5_of_8"),
        ];

        let (selector, remaining) = ShardSelector::from_matchers(&matchers).unwrap();
        let selector = selector.unwrap();
        assert_eq!(selector.index(), 5);
        assert_eq!(selector.count(), 8);
        assert_eq!(remaining, vec![LabelMatcher::eq("job", "api")]);
    }

    #[test]
    fn shard_selector_absent() {
        let matchers = vec![LabelMatcher::eq("job", "api")];
        let (selector, remaining) = ShardSelector::from_matchers(&matchers).unwrap();
        assert!(selector.is_none());
        assert_eq!(remaining.len(), 1);
    }

    #[test]
    fn shard_selector_malformed_is_an_error() {
        let matchers = vec![LabelMatcher::eq(SHARD_LABEL, "8_of_8")];
        assert!(ShardSelector::from_matchers(&matchers).is_err());
    }

    #[test]
    fn label_set_sorts_and_fingerprints() {
        let a = LabelSet::new(vec![
            Label::new("job", "api"),
            Label::new("__name__", "up"),
        ]);
        let b = LabelSet::new(vec![
            Label::new("__name__", "up"),
            Label::new("job", "api"),
        ]);

        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.get("job"), Some("api"));
        assert_eq!(a.iter().next().unwrap().name, "__name__");

        let c = LabelSet::new(vec![Label::new("job", "web")]);
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn label_set_display() {
        let ls = LabelSet::new(vec![Label::new("job", "api")]);
        assert_eq!(ls.to_string(), "{job=\"api\"}");
    }
}
