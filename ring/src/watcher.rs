//! Background maintenance of the process-wide ring view.

use crate::{KvError, Ring, RingDesc};
use async_trait::async_trait;
use observability_deps::tracing::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::{collections::HashMap, fmt::Debug, sync::Arc, time::Duration};
use tephra_time::TimeProvider;
use tokio_util::sync::CancellationToken;

/// Read access to the KV store holding ring values.
#[async_trait]
pub trait RingKv: Debug + Send + Sync + 'static {
    /// Fetch the ring value stored under `key`, `None` if the key does not
    /// exist yet.
    async fn get(&self, key: &str) -> Result<Option<RingDesc>, KvError>;
}

/// In-memory [`RingKv`] for tests.
#[derive(Debug, Default)]
pub struct MockRingKv {
    values: Mutex<HashMap<String, RingDesc>>,
    unavailable: Mutex<bool>,
}

impl MockRingKv {
    /// Create an empty store.
    pub fn new() -> Self {
        Default::default()
    }

    /// Store `desc` under `key`.
    pub fn set(&self, key: impl Into<String>, desc: RingDesc) {
        self.values.lock().insert(key.into(), desc);
    }

    /// Make every subsequent `get` fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }
}

#[async_trait]
impl RingKv for MockRingKv {
    async fn get(&self, key: &str) -> Result<Option<RingDesc>, KvError> {
        if *self.unavailable.lock() {
            return Err(KvError::Unavailable {
                key: key.to_string(),
                reason: "mock outage".to_string(),
            });
        }
        Ok(self.values.lock().get(key).cloned())
    }
}

/// The process-wide, atomically swapped ring snapshot.
///
/// Request threads read snapshots; only the [`RingWatcher`] writes.
#[derive(Debug)]
pub struct RingView {
    current: RwLock<Arc<Ring>>,
}

impl RingView {
    /// A view holding an empty ring, for use before the first poll or in
    /// tests.
    pub fn empty() -> Self {
        Self::new(Ring::new(
            &RingDesc::default(),
            Duration::ZERO,
            tephra_time::Time::from_timestamp_nanos(0),
        ))
    }

    /// A view seeded with `ring`.
    pub fn new(ring: Ring) -> Self {
        Self {
            current: RwLock::new(Arc::new(ring)),
        }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<Ring> {
        Arc::clone(&self.current.read())
    }

    /// Swap in a new snapshot.
    pub fn update(&self, ring: Ring) {
        *self.current.write() = Arc::new(ring);
    }
}

/// Configuration of a [`RingWatcher`].
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// KV key of the ring value, usually the component name.
    pub key: String,
    /// How often to poll the KV store.
    pub poll_interval: Duration,
    /// Heartbeats older than this mark an instance as absent.
    pub heartbeat_timeout: Duration,
}

/// Polls the KV store and refreshes a [`RingView`].
#[derive(Debug)]
pub struct RingWatcher {
    kv: Arc<dyn RingKv>,
    config: WatcherConfig,
    time_provider: Arc<dyn TimeProvider>,
    view: Arc<RingView>,
}

impl RingWatcher {
    /// Create a watcher; the associated view starts out empty.
    pub fn new(
        kv: Arc<dyn RingKv>,
        config: WatcherConfig,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            kv,
            config,
            time_provider,
            view: Arc::new(RingView::empty()),
        }
    }

    /// The view this watcher maintains.
    pub fn view(&self) -> Arc<RingView> {
        Arc::clone(&self.view)
    }

    /// Fetch the ring value once and swap the view.
    ///
    /// A missing key is treated as an empty ring; a KV error keeps the
    /// previous snapshot in place.
    pub async fn poll_once(&self) -> Result<(), KvError> {
        let desc = match self.kv.get(&self.config.key).await? {
            Some(desc) => desc,
            None => {
                warn!(key = %self.config.key, "ring key not found, using empty ring");
                RingDesc::default()
            }
        };

        let ring = Ring::new(
            &desc,
            self.config.heartbeat_timeout,
            self.time_provider.now(),
        );
        debug!(
            key = %self.config.key,
            n_healthy = ring.instances().len(),
            "refreshed ring snapshot"
        );
        self.view.update(ring);
        Ok(())
    }

    /// Poll until `shutdown` fires. Poll failures are logged and retried at
    /// the next interval; readers keep the last good snapshot meanwhile.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            if let Err(e) = self.poll_once().await {
                warn!(%e, key = %self.config.key, "ring poll failed, keeping previous snapshot");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.cancelled() => {
                    info!(key = %self.config.key, "ring watcher shutdown");
                    return;
                }
            }
        }
    }
}
