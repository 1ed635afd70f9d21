//! Backoff functionality.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use observability_deps::tracing::warn;
use rand::prelude::*;
use std::time::Duration;

/// Exponential backoff with jitter
///
/// See <https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/>
#[derive(Debug, Clone)]
#[allow(missing_copy_implementations)]
pub struct BackoffConfig {
    /// Initial backoff.
    pub init_backoff: Duration,

    /// Maximum backoff.
    pub max_backoff: Duration,

    /// Multiplier for each backoff round.
    pub base: f64,

    /// Total time after which retrying is abandoned.
    pub deadline: Option<Duration>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(500),
            base: 3.,
            deadline: None,
        }
    }
}

/// Error after giving up retrying.
#[derive(Debug)]
pub struct BackoffError<E> {
    /// Total time spent sleeping between attempts before giving up.
    pub slept: Duration,

    /// The error returned by the final attempt.
    pub source: E,
}

impl<E: std::fmt::Display> std::fmt::Display for BackoffError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "retry deadline exceeded after backing off for {:?}: {}",
            self.slept, self.source
        )
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BackoffError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Backoff result.
pub type BackoffResult<T, E> = Result<T, BackoffError<E>>;

/// Tracks the backoff state across consecutive attempts of one task.
///
/// Created from a [`BackoffConfig`]; each call to [`Backoff::next`] yields the
/// next interval to sleep, or `None` once the configured deadline is spent.
pub struct Backoff {
    init_backoff: f64,
    next_backoff_secs: f64,
    max_backoff_secs: f64,
    base: f64,
    slept: Duration,
    deadline: Option<Duration>,
    rng: Option<Box<dyn RngCore + Sync + Send>>,
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("next_backoff_secs", &self.next_backoff_secs)
            .field("slept", &self.slept)
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl Backoff {
    /// Create a new [`Backoff`] from the provided [`BackoffConfig`].
    pub fn new(config: &BackoffConfig) -> Self {
        Self::new_with_rng(config, None)
    }

    /// Creates a new `Backoff` with the optional `rng`.
    ///
    /// Uses [`rand::thread_rng()`] if no rng provided.
    pub fn new_with_rng(
        config: &BackoffConfig,
        rng: Option<Box<dyn RngCore + Sync + Send>>,
    ) -> Self {
        let init_backoff = config.init_backoff.as_secs_f64();
        Self {
            init_backoff,
            next_backoff_secs: init_backoff,
            max_backoff_secs: config.max_backoff.as_secs_f64(),
            base: config.base,
            slept: Duration::ZERO,
            deadline: config.deadline,
            rng,
        }
    }

    /// Returns the next backoff duration to wait for, or `None` once the
    /// deadline is exhausted.
    fn next(&mut self) -> Option<Duration> {
        let range = self.init_backoff..(self.next_backoff_secs * self.base);

        let rand_backoff = match self.rng.as_mut() {
            Some(rng) => rng.gen_range(range),
            None => thread_rng().gen_range(range),
        };

        let next_backoff = self.max_backoff_secs.min(rand_backoff);
        let this_backoff =
            Duration::from_secs_f64(std::mem::replace(&mut self.next_backoff_secs, next_backoff));

        if let Some(deadline) = self.deadline {
            if self.slept + this_backoff > deadline {
                return None;
            }
        }
        self.slept += this_backoff;
        Some(this_backoff)
    }

    /// Perform an async operation, retrying every error with backoff until
    /// the deadline (if any) is exhausted.
    pub async fn retry_all_errors<F, F1, B, E>(
        &mut self,
        task_name: &str,
        mut do_stuff: F,
    ) -> BackoffResult<B, E>
    where
        F: (FnMut() -> F1) + Send,
        F1: std::future::Future<Output = Result<B, E>> + Send,
        E: std::error::Error + Send,
    {
        loop {
            // first produce the future and then await it, so `F` need not be `Sync`
            let fut = do_stuff();

            let e = match fut.await {
                Ok(b) => break Ok(b),
                Err(e) => e,
            };

            let backoff = match self.next() {
                Some(backoff) => backoff,
                None => {
                    break Err(BackoffError {
                        slept: self.slept,
                        source: e,
                    })
                }
            };

            warn!(
                e=%e,
                task_name,
                backoff_secs = backoff.as_secs_f64(),
                "request encountered non-fatal error - backing off",
            );
            tokio::time::sleep(backoff).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fixed_rng(step: u64) -> Option<Box<dyn RngCore + Sync + Send>> {
        Some(Box::new(StepRng::new(step, 0)))
    }

    #[test]
    fn intervals_grow_up_to_max() {
        let config = BackoffConfig {
            init_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(100),
            base: 2.,
            deadline: None,
        };

        // rng pinned to the top of the range: pure exponential growth
        let mut backoff = Backoff::new_with_rng(&config, fixed_rng(u64::MAX));
        let mut expected = 1.0_f64;
        for _ in 0..10 {
            let next = backoff.next().unwrap().as_secs_f64();
            assert!((next - expected).abs() < 1e-4, "{next} != {expected}");
            expected = (expected * 2.).min(100.);
        }
    }

    #[test]
    fn intervals_at_bottom_of_range_stay_at_init() {
        let config = BackoffConfig {
            init_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(100),
            base: 2.,
            deadline: None,
        };

        let mut backoff = Backoff::new_with_rng(&config, fixed_rng(0));
        for _ in 0..10 {
            assert_eq!(backoff.next().unwrap(), Duration::from_secs(1));
        }
    }

    #[test]
    fn deadline_exhausts() {
        let config = BackoffConfig {
            init_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(1),
            base: 1.,
            deadline: Some(Duration::from_secs(3)),
        };

        let mut backoff = Backoff::new_with_rng(&config, fixed_rng(0));
        assert!(backoff.next().is_some());
        assert!(backoff.next().is_some());
        assert!(backoff.next().is_some());
        assert!(backoff.next().is_none());
        assert_eq!(backoff.slept, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn retry_all_errors_eventually_succeeds() {
        let config = BackoffConfig {
            init_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
            base: 1.,
            deadline: None,
        };

        let attempts = AtomicUsize::new(0);
        let got = Backoff::new_with_rng(&config, fixed_rng(0))
            .retry_all_errors("test", || async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();

        assert_eq!(got, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_all_errors_gives_up_at_deadline() {
        let config = BackoffConfig {
            init_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
            base: 1.,
            deadline: Some(Duration::from_millis(2)),
        };

        let err = Backoff::new_with_rng(&config, fixed_rng(0))
            .retry_all_errors::<_, _, (), _>("test", || async {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
            })
            .await
            .unwrap_err();

        assert_eq!(err.slept, Duration::from_millis(2));
        assert_eq!(err.source.to_string(), "boom");
    }
}
