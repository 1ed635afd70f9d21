//! In-process metric primitives for tephra.
//!
//! A [`Registry`] holds named instruments; an instrument ([`Metric`]) fans out
//! into per-[`Attributes`] observers that are cheap to clone and update from
//! hot paths. There is intentionally no exposition format here; reporters
//! live outside this workspace.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use parking_lot::Mutex;
use std::{
    any::Any,
    borrow::Cow,
    collections::BTreeMap,
    fmt::Debug,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

/// A sorted set of key-value pairs identifying one observer of a [`Metric`].
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Attributes(BTreeMap<&'static str, Cow<'static, str>>);

impl Attributes {
    /// Set `key` to `value`, replacing any previous value.
    pub fn insert(&mut self, key: &'static str, value: impl Into<Cow<'static, str>>) {
        self.0.insert(key, value.into());
    }

    /// Iterate pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&&'static str, &Cow<'static, str>)> {
        self.0.iter()
    }
}

impl<const N: usize> From<[(&'static str, &'static str); N]> for Attributes {
    fn from(pairs: [(&'static str, &'static str); N]) -> Self {
        Self(pairs.into_iter().map(|(k, v)| (k, Cow::from(v))).collect())
    }
}

impl<const N: usize> From<&[(&'static str, &'static str); N]> for Attributes {
    fn from(pairs: &[(&'static str, &'static str); N]) -> Self {
        Self::from(*pairs)
    }
}

impl<const N: usize> From<[(&'static str, String); N]> for Attributes {
    fn from(pairs: [(&'static str, String); N]) -> Self {
        Self(pairs.into_iter().map(|(k, v)| (k, Cow::from(v))).collect())
    }
}

/// Types that can act as the per-attribute observer of a [`Metric`].
///
/// Observers are shared-state handles: clones update and read the same value.
pub trait MetricObserver: Debug + Default + Clone + Send + Sync + 'static {}

/// A monotonically increasing counter.
#[derive(Debug, Clone, Default)]
pub struct U64Counter {
    state: Arc<AtomicU64>,
}

impl U64Counter {
    /// Increment the counter by `count`.
    pub fn inc(&self, count: u64) {
        self.state.fetch_add(count, Ordering::Relaxed);
    }

    /// Read the current value.
    pub fn fetch(&self) -> u64 {
        self.state.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Counter {}

/// A gauge that can be set to arbitrary values.
#[derive(Debug, Clone, Default)]
pub struct U64Gauge {
    state: Arc<AtomicU64>,
}

impl U64Gauge {
    /// Set the gauge to `value`.
    pub fn set(&self, value: u64) {
        self.state.store(value, Ordering::Relaxed);
    }

    /// Read the current value.
    pub fn fetch(&self) -> u64 {
        self.state.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Gauge {}

/// Records a distribution of `u64` samples as count and sum.
#[derive(Debug, Clone, Default)]
pub struct U64Histogram {
    count: Arc<AtomicU64>,
    sum: Arc<AtomicU64>,
}

impl U64Histogram {
    /// Record one sample.
    pub fn record(&self, value: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
    }

    /// Number of recorded samples.
    pub fn fetch_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of recorded samples.
    pub fn fetch_sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Histogram {}

/// Records a distribution of durations as count and total.
#[derive(Debug, Clone, Default)]
pub struct DurationHistogram {
    inner: U64Histogram,
}

impl DurationHistogram {
    /// Record one sample.
    pub fn record(&self, duration: Duration) {
        self.inner
            .record(duration.as_nanos().try_into().unwrap_or(u64::MAX));
    }

    /// Number of recorded samples.
    pub fn fetch_count(&self) -> u64 {
        self.inner.fetch_count()
    }

    /// Sum of recorded samples.
    pub fn fetch_total(&self) -> Duration {
        Duration::from_nanos(self.inner.fetch_sum())
    }
}

impl MetricObserver for DurationHistogram {}

/// A named instrument fanning out into per-[`Attributes`] observers.
#[derive(Debug)]
pub struct Metric<T: MetricObserver> {
    name: &'static str,
    description: &'static str,
    observers: Arc<Mutex<BTreeMap<Attributes, T>>>,
}

// Manual impl: `derive(Clone)` would bound `T: Clone` on the struct itself.
impl<T: MetricObserver> Clone for Metric<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            description: self.description,
            observers: Arc::clone(&self.observers),
        }
    }
}

impl<T: MetricObserver> Metric<T> {
    fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            observers: Default::default(),
        }
    }

    /// Instrument name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Instrument help text.
    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Return the observer for `attributes`, creating it on first use.
    pub fn recorder(&self, attributes: impl Into<Attributes>) -> T {
        self.observers
            .lock()
            .entry(attributes.into())
            .or_default()
            .clone()
    }

    /// Return the observer for `attributes` if it has been created.
    pub fn get_observer(&self, attributes: &Attributes) -> Option<T> {
        self.observers.lock().get(attributes).cloned()
    }
}

/// Holds every instrument registered by a process.
#[derive(Default)]
pub struct Registry {
    instruments: Mutex<BTreeMap<&'static str, Box<dyn Any + Send + Sync>>>,
}

impl Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field(
                "instruments",
                &self.instruments.lock().keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Default::default()
    }

    /// Return the instrument called `name`, creating it if absent.
    ///
    /// Panics if `name` was previously registered with a different observer
    /// type; instrument names are global to the registry.
    pub fn register_metric<T: MetricObserver>(
        &self,
        name: &'static str,
        description: &'static str,
    ) -> Metric<T> {
        let mut instruments = self.instruments.lock();
        let entry = instruments
            .entry(name)
            .or_insert_with(|| Box::new(Metric::<T>::new(name, description)));
        entry
            .downcast_ref::<Metric<T>>()
            .unwrap_or_else(|| panic!("metric \"{name}\" registered with a different type"))
            .clone()
    }

    /// Look up a previously registered instrument by name.
    pub fn get_instrument<T: MetricObserver>(&self, name: &'static str) -> Option<Metric<T>> {
        self.instruments
            .lock()
            .get(name)
            .and_then(|i| i.downcast_ref::<Metric<T>>())
            .cloned()
    }
}
