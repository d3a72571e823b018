//! Background Expiry Sweeper
//!
//! Lazy expiry hides an expired entry from readers but leaves it in memory
//! until some writer touches the key. The sweeper is the active half: a tokio
//! task that periodically removes every expired entry.
//!
//! The sweep interval adapts. When a large share of scanned entries turns out
//! to be expired the interval halves (down to `min_interval`); when nothing
//! expires it doubles (up to `max_interval`).

use crate::storage::StorageEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace};

/// Configuration for the expiry sweeper.
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    /// Interval used for the first sweep (default: 100ms)
    pub base_interval: Duration,

    /// Lower bound for the adaptive interval (default: 10ms)
    pub min_interval: Duration,

    /// Upper bound for the adaptive interval (default: 1s)
    pub max_interval: Duration,

    /// Expired/scanned ratio above which sweeping speeds up
    pub speedup_threshold: f64,

    /// Expired/scanned ratio below which sweeping slows down
    pub slowdown_threshold: f64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(100),
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(1),
            speedup_threshold: 0.25,
            slowdown_threshold: 0.01,
        }
    }
}

impl ExpiryConfig {
    /// Default thresholds around a custom base interval. The bounds are
    /// widened if needed so that `min <= base <= max`.
    pub fn with_base_interval(base_interval: Duration) -> Self {
        let defaults = Self::default();
        Self {
            base_interval,
            min_interval: defaults.min_interval.min(base_interval),
            max_interval: defaults.max_interval.max(base_interval),
            ..defaults
        }
    }

    /// Next interval given the outcome of the last sweep.
    fn adjust(&self, current: Duration, scanned: u64, expired: u64) -> Duration {
        if scanned == 0 {
            return current;
        }
        let rate = expired as f64 / scanned as f64;
        if rate > self.speedup_threshold {
            (current / 2).max(self.min_interval)
        } else if rate < self.slowdown_threshold && expired == 0 {
            (current * 2).min(self.max_interval)
        } else {
            current
        }
    }
}

/// Handle to the running sweeper task. Dropping it stops the task.
#[derive(Debug)]
pub struct ExpirySweeper {
    shutdown_tx: watch::Sender<bool>,
}

impl ExpirySweeper {
    /// Spawns the sweeper on the current tokio runtime.
    ///
    /// ```ignore
    /// use polykv::storage::{StorageEngine, ExpirySweeper, ExpiryConfig};
    /// use std::sync::Arc;
    ///
    /// let engine = Arc::new(StorageEngine::new());
    /// let sweeper = ExpirySweeper::start(engine, ExpiryConfig::default());
    /// drop(sweeper);
    /// ```
    pub fn start(engine: Arc<StorageEngine>, config: ExpiryConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            interval_ms = config.base_interval.as_millis() as u64,
            "Background expiry sweeper started"
        );
        tokio::spawn(sweeper_loop(engine, config, shutdown_rx));

        Self { shutdown_tx }
    }

    /// Stops the sweeper. Called automatically on drop.
    pub fn stop(&self) {
        if self.shutdown_tx.send(true).is_ok() {
            info!("Background expiry sweeper stopped");
        }
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sweeper_loop(
    engine: Arc<StorageEngine>,
    config: ExpiryConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = config.base_interval;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Expiry sweeper received shutdown signal");
                    return;
                }
            }
        }

        let sweep = engine.cleanup_expired();
        let next = config.adjust(interval, sweep.scanned, sweep.expired);

        if next < interval {
            debug!(
                expired = sweep.expired,
                scanned = sweep.scanned,
                new_interval_ms = next.as_millis() as u64,
                "High expiry rate, speeding up sweeper"
            );
        } else if next > interval {
            trace!(
                new_interval_ms = next.as_millis() as u64,
                "Low expiry rate, slowing down sweeper"
            );
        }
        if sweep.expired > 0 {
            debug!(
                expired = sweep.expired,
                keys_remaining = sweep.scanned - sweep.expired,
                "Expired keys cleaned up"
            );
        }

        interval = next;
    }
}

/// Starts the expiry sweeper with default configuration.
pub fn start_expiry_sweeper(engine: Arc<StorageEngine>) -> ExpirySweeper {
    ExpirySweeper::start(engine, ExpiryConfig::default())
}
