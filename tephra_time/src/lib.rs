//! Wall-clock abstraction for tephra.
//!
//! All components take an `Arc<dyn TimeProvider>` so that staleness windows,
//! grace periods and eviction deadlines can be driven deterministically in
//! tests via [`MockProvider`].
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use chrono::{TimeZone, Utc};
use parking_lot::RwLock;
use std::{
    fmt::Debug,
    ops::{Add, Sub},
    time::Duration,
};

/// A UTC instant with nanosecond precision.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(i64);

impl Time {
    /// Create from nanoseconds since the Unix epoch.
    pub fn from_timestamp_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Create from milliseconds since the Unix epoch.
    pub fn from_timestamp_millis(millis: i64) -> Self {
        Self(millis * 1_000_000)
    }

    /// Nanoseconds since the Unix epoch.
    pub fn timestamp_nanos(&self) -> i64 {
        self.0
    }

    /// Milliseconds since the Unix epoch, truncating sub-millisecond precision.
    pub fn timestamp_millis(&self) -> i64 {
        self.0.div_euclid(1_000_000)
    }

    /// `self + duration`, `None` on overflow.
    pub fn checked_add(&self, duration: Duration) -> Option<Self> {
        let nanos: i64 = duration.as_nanos().try_into().ok()?;
        self.0.checked_add(nanos).map(Self)
    }

    /// `self - duration`, `None` on underflow.
    pub fn checked_sub(&self, duration: Duration) -> Option<Self> {
        let nanos: i64 = duration.as_nanos().try_into().ok()?;
        self.0.checked_sub(nanos).map(Self)
    }

    /// Elapsed wall-clock time since `earlier`, `None` if `earlier` is in the
    /// future of `self`.
    pub fn checked_duration_since(&self, earlier: Self) -> Option<Duration> {
        self.0
            .checked_sub(earlier.0)
            .and_then(|d| u64::try_from(d).ok())
            .map(Duration::from_nanos)
    }
}

impl Debug for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        match Utc.timestamp_opt(secs, nanos).single() {
            Some(dt) => write!(f, "{}", dt.to_rfc3339()),
            None => write!(f, "Time({}ns)", self.0),
        }
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        self.checked_add(rhs).expect("timestamp overflow")
    }
}

impl Sub<Duration> for Time {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self::Output {
        self.checked_sub(rhs).expect("timestamp underflow")
    }
}

/// A source of [`Time`].
pub trait TimeProvider: Debug + Send + Sync + 'static {
    /// Current instant.
    fn now(&self) -> Time;
}

/// [`TimeProvider`] backed by the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider;

impl SystemProvider {
    /// Create a new system clock provider.
    pub fn new() -> Self {
        Self
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        let dt = Utc::now();
        Time(dt.timestamp() * 1_000_000_000 + i64::from(dt.timestamp_subsec_nanos()))
    }
}

/// A [`TimeProvider`] whose clock only moves when told to.
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<Time>,
}

impl MockProvider {
    /// Create a mock clock reading `start`.
    pub fn new(start: Time) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Set the clock to `time`.
    pub fn set(&self, time: Time) {
        *self.now.write() = time;
    }

    /// Advance the clock by `duration`, returning the new reading.
    pub fn inc(&self, duration: Duration) -> Time {
        let mut now = self.now.write();
        *now = *now + duration;
        *now
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_arithmetic() {
        let t = Time::from_timestamp_millis(1_000);
        assert_eq!(t.timestamp_nanos(), 1_000_000_000);
        assert_eq!((t + Duration::from_millis(500)).timestamp_millis(), 1_500);
        assert_eq!((t - Duration::from_millis(500)).timestamp_millis(), 500);

        assert_eq!(
            t.checked_duration_since(Time::from_timestamp_millis(400)),
            Some(Duration::from_millis(600))
        );
        assert_eq!(
            t.checked_duration_since(Time::from_timestamp_millis(2_000)),
            None
        );
    }

    #[test]
    fn millis_truncate() {
        let t = Time::from_timestamp_nanos(1_999_999);
        assert_eq!(t.timestamp_millis(), 1);
    }

    #[test]
    fn mock_provider() {
        let provider = MockProvider::new(Time::from_timestamp_nanos(0));
        assert_eq!(provider.now().timestamp_nanos(), 0);

        provider.inc(Duration::from_nanos(10));
        assert_eq!(provider.now().timestamp_nanos(), 10);

        provider.set(Time::from_timestamp_millis(2));
        assert_eq!(provider.now().timestamp_nanos(), 2_000_000);
    }

    #[test]
    fn system_provider_advances() {
        let provider = SystemProvider::new();
        let a = provider.now();
        let b = provider.now();
        assert!(b >= a);
    }

    #[test]
    fn display_is_rfc3339() {
        let t = Time::from_timestamp_millis(0);
        assert_eq!(format!("{t}"), "1970-01-01T00:00:00+00:00");
    }
}
