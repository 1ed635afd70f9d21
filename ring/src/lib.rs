//! Read-only views onto the consistent-hash ring shared by the query path
//! and the ruler.
//!
//! The ring itself is maintained externally in a KV store as a single value
//! per component. This crate models that value ([`RingDesc`]), turns it into
//! immutable lookup snapshots ([`Ring`]) and keeps a process-wide view fresh
//! via a background [`RingWatcher`]. Consumers only ever see snapshots; an
//! instance whose heartbeat is older than the configured timeout is absent
//! from them.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod watcher;

pub use watcher::{MockRingKv, RingKv, RingView, RingWatcher, WatcherConfig};

use data_types::{ReplicaAddr, TenantId};
use snafu::Snafu;
use std::{collections::BTreeSet, time::Duration};
use tephra_time::Time;

/// Errors reading the ring from its KV store.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum KvError {
    #[snafu(display("ring key {:?} cannot be read: {}", key, reason))]
    Unavailable { key: String, reason: String },
}

/// 32-bit FNV-1a, the token hash shared with the ruler's ownership rule.
pub fn fnv32a(data: &[u8]) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    let mut hash = OFFSET;
    for b in data {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Lifecycle state of a ring member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[allow(missing_docs)]
pub enum InstanceState {
    Joining,
    Active,
    Leaving,
}

/// One member of the ring as stored in the KV value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDesc {
    /// Stable instance identifier.
    pub id: String,
    /// Routable address.
    pub addr: ReplicaAddr,
    /// Tokens owned by this instance.
    pub tokens: Vec<u32>,
    /// Lifecycle state.
    pub state: InstanceState,
    /// Last heartbeat written by the instance.
    pub heartbeat: Time,
}

/// The complete ring value as stored under one KV key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RingDesc {
    /// All registered instances, healthy or not.
    pub instances: Vec<InstanceDesc>,
}

/// An immutable, health-filtered snapshot of the ring.
///
/// Token lookups resolve against ACTIVE instances only; `instances()` exposes
/// every healthy member regardless of state so that callers can reason about
/// their own lifecycle (e.g. the ruler waiting to become ACTIVE).
#[derive(Debug, Clone)]
pub struct Ring {
    instances: Vec<InstanceDesc>,
    /// `(token, index into instances)`, sorted by token. Active members only.
    token_table: Vec<(u32, usize)>,
}

impl Ring {
    /// Build a snapshot from `desc`, dropping instances whose heartbeat is
    /// older than `heartbeat_timeout` relative to `now`.
    pub fn new(desc: &RingDesc, heartbeat_timeout: Duration, now: Time) -> Self {
        let instances: Vec<InstanceDesc> = desc
            .instances
            .iter()
            .filter(|i| {
                now.checked_duration_since(i.heartbeat)
                    .map(|age| age <= heartbeat_timeout)
                    // heartbeat in the future: clock skew, treat as fresh
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        Self::from_healthy(instances)
    }

    fn from_healthy(instances: Vec<InstanceDesc>) -> Self {
        let mut token_table: Vec<(u32, usize)> = instances
            .iter()
            .enumerate()
            .filter(|(_, i)| i.state == InstanceState::Active)
            .flat_map(|(idx, i)| i.tokens.iter().map(move |t| (*t, idx)))
            .collect();
        token_table.sort_unstable();

        Self {
            instances,
            token_table,
        }
    }

    /// Every healthy instance, in KV order.
    pub fn instances(&self) -> &[InstanceDesc] {
        &self.instances
    }

    /// Whether no ACTIVE instance owns any token.
    pub fn is_empty(&self) -> bool {
        self.token_table.is_empty()
    }

    /// The healthy instance registered under `addr`, if any.
    pub fn instance_by_addr(&self, addr: &ReplicaAddr) -> Option<&InstanceDesc> {
        self.instances.iter().find(|i| &i.addr == addr)
    }

    /// The primary owner of `token`: the ACTIVE instance holding the first
    /// ring token at or after it, wrapping around.
    pub fn primary_for(&self, token: u32) -> Option<&InstanceDesc> {
        self.owners_for(token, 1).into_iter().next()
    }

    /// Up to `n` distinct ACTIVE owners of `token`, walking the ring
    /// clockwise from the token's position.
    pub fn owners_for(&self, token: u32, n: usize) -> Vec<&InstanceDesc> {
        if self.token_table.is_empty() || n == 0 {
            return vec![];
        }

        let start = self
            .token_table
            .partition_point(|(t, _)| *t < token)
            .rem_euclid(self.token_table.len());

        let mut seen = BTreeSet::new();
        let mut owners = Vec::with_capacity(n);
        for offset in 0..self.token_table.len() {
            let (_, idx) = self.token_table[(start + offset) % self.token_table.len()];
            if seen.insert(idx) {
                owners.push(&self.instances[idx]);
                if owners.len() == n {
                    break;
                }
            }
        }
        owners
    }

    /// A deterministic per-tenant sub-ring of up to `size` instances.
    ///
    /// Instances are ranked by `fnv32a(tenant \0 instance-id)` so the subset
    /// is stable across snapshots as long as membership does not change.
    /// `size == 0` disables sharding and returns the full snapshot.
    pub fn shuffle_shard(&self, tenant: &TenantId, size: usize) -> Self {
        if size == 0 || size >= self.instances.len() {
            return self.clone();
        }

        let mut ranked: Vec<(u32, &InstanceDesc)> = self
            .instances
            .iter()
            .map(|i| {
                let mut key = Vec::with_capacity(tenant.as_str().len() + 1 + i.id.len());
                key.extend_from_slice(tenant.as_str().as_bytes());
                key.push(0);
                key.extend_from_slice(i.id.as_bytes());
                (fnv32a(&key), i)
            })
            .collect();
        // instance id as tie-breaker keeps the subset total-ordered
        ranked.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));

        // members already passed the health filter of the parent snapshot
        Self::from_healthy(
            ranked
                .into_iter()
                .take(size)
                .map(|(_, i)| i.clone())
                .collect(),
        )
    }

    /// Fingerprint of the healthy membership, used to detect ring changes
    /// between snapshots. Token movements count as changes.
    pub fn membership_fingerprint(&self) -> Vec<(String, InstanceState, u32)> {
        let mut fp: Vec<_> = self
            .instances
            .iter()
            .map(|i| (i.id.clone(), i.state, fnv32a_tokens(&i.tokens)))
            .collect();
        fp.sort();
        fp
    }
}

fn fnv32a_tokens(tokens: &[u32]) -> u32 {
    let mut bytes = Vec::with_capacity(tokens.len() * 4);
    for t in tokens {
        bytes.extend_from_slice(&t.to_be_bytes());
    }
    fnv32a(&bytes)
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;

    pub(crate) fn instance(id: &str, tokens: Vec<u32>, state: InstanceState) -> InstanceDesc {
        InstanceDesc {
            id: id.to_string(),
            addr: ReplicaAddr::new(format!("{id}:9095")),
            tokens,
            state,
            heartbeat: Time::from_timestamp_millis(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{test_fixtures::instance, *};

    fn ring(desc: &RingDesc) -> Ring {
        Ring::new(desc, Duration::from_secs(60), Time::from_timestamp_millis(0))
    }

    #[test]
    fn fnv32a_reference_values() {
        // reference vectors from the FNV specification
        assert_eq!(fnv32a(b""), 0x811c_9dc5);
        assert_eq!(fnv32a(b"a"), 0xe40c_292c);
        assert_eq!(fnv32a(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn primary_is_first_token_at_or_after() {
        let desc = RingDesc {
            instances: vec![
                instance("i1", vec![100, 300], InstanceState::Active),
                instance("i2", vec![200], InstanceState::Active),
            ],
        };
        let ring = ring(&desc);

        assert_eq!(ring.primary_for(100).unwrap().id, "i1");
        assert_eq!(ring.primary_for(150).unwrap().id, "i2");
        assert_eq!(ring.primary_for(250).unwrap().id, "i1");
        // wrap-around past the highest token
        assert_eq!(ring.primary_for(301).unwrap().id, "i1");
    }

    #[test]
    fn owners_are_distinct_instances() {
        let desc = RingDesc {
            instances: vec![
                instance("i1", vec![100, 110, 120], InstanceState::Active),
                instance("i2", vec![130], InstanceState::Active),
            ],
        };
        let ring = ring(&desc);

        let owners = ring.owners_for(99, 2);
        assert_eq!(owners.len(), 2);
        assert_eq!(owners[0].id, "i1");
        assert_eq!(owners[1].id, "i2");

        // more owners requested than instances exist
        assert_eq!(ring.owners_for(99, 5).len(), 2);
    }

    #[test]
    fn non_active_instances_own_no_tokens() {
        let desc = RingDesc {
            instances: vec![
                instance("i1", vec![100], InstanceState::Leaving),
                instance("i2", vec![200], InstanceState::Active),
            ],
        };
        let ring = ring(&desc);

        assert_eq!(ring.primary_for(50).unwrap().id, "i2");
        // still visible as a healthy member
        assert!(ring.instances().iter().any(|i| i.id == "i1"));
    }

    #[test]
    fn expired_heartbeat_instances_are_absent() {
        let mut stale = instance("i1", vec![100], InstanceState::Active);
        stale.heartbeat = Time::from_timestamp_millis(0);
        let mut fresh = instance("i2", vec![200], InstanceState::Active);
        fresh.heartbeat = Time::from_timestamp_millis(90_000);

        let desc = RingDesc {
            instances: vec![stale, fresh],
        };
        let ring = Ring::new(
            &desc,
            Duration::from_secs(60),
            Time::from_timestamp_millis(100_000),
        );

        assert_eq!(ring.instances().len(), 1);
        assert_eq!(ring.primary_for(50).unwrap().id, "i2");
    }

    #[test]
    fn empty_ring() {
        let ring = ring(&RingDesc::default());
        assert!(ring.is_empty());
        assert!(ring.primary_for(0).is_none());
        assert!(ring.owners_for(0, 3).is_empty());
    }

    #[test]
    fn shuffle_shard_is_deterministic_and_bounded() {
        let desc = RingDesc {
            instances: (0..10)
                .map(|i| instance(&format!("i{i}"), vec![i * 100], InstanceState::Active))
                .collect(),
        };
        let ring = ring(&desc);
        let tenant = TenantId::new("team-a").unwrap();

        let a = ring.shuffle_shard(&tenant, 3);
        let b = ring.shuffle_shard(&tenant, 3);
        assert_eq!(a.membership_fingerprint(), b.membership_fingerprint());
        assert_eq!(a.instances().len(), 3);

        // different tenants get (usually) different subsets; at minimum the
        // subset stays within the parent membership
        let other = ring.shuffle_shard(&TenantId::new("team-b").unwrap(), 3);
        for i in other.instances() {
            assert!(ring.instances().iter().any(|p| p.id == i.id));
        }

        // size 0 disables sharding
        assert_eq!(ring.shuffle_shard(&tenant, 0).instances().len(), 10);
        // oversized shard returns everything
        assert_eq!(ring.shuffle_shard(&tenant, 64).instances().len(), 10);
    }

    #[test]
    fn membership_fingerprint_tracks_state_and_tokens() {
        let desc = RingDesc {
            instances: vec![instance("i1", vec![100], InstanceState::Active)],
        };
        let base = ring(&desc).membership_fingerprint();

        let mut changed_state = desc.clone();
        changed_state.instances[0].state = InstanceState::Leaving;
        assert_ne!(ring(&changed_state).membership_fingerprint(), base);

        let mut changed_tokens = desc.clone();
        changed_tokens.instances[0].tokens = vec![101];
        assert_ne!(ring(&changed_tokens).membership_fingerprint(), base);

        assert_eq!(ring(&desc).membership_fingerprint(), base);
    }
}
