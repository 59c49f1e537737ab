//! Background expiry sweeper.
//!
//! Redemption already refuses expired keys; the sweeper only reclaims their
//! storage. One pass scans the whole namespace in cursor batches.

use crate::config::ServiceConfig;
use crate::store::{KeyStore, SweepReport};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Clone)]
pub struct Sweeper {
    store: KeyStore,
    interval: Duration,
    batch_size: usize,
}

impl Sweeper {
    pub fn new(store: KeyStore, config: &ServiceConfig) -> Self {
        Self {
            store,
            interval: config.sweep_interval(),
            batch_size: config.sweep_batch_size.max(1),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one pass on the blocking pool.
    pub async fn run_once(&self) -> Result<SweepReport, crate::StoreError> {
        let store = self.store.clone();
        let batch = self.batch_size;
        tokio::task::spawn_blocking(move || store.sweep_expired(batch))
            .await
            .map_err(|e| crate::StoreError::Database(format!("sweep task failed: {e}")))?
    }

    /// Sweep every `interval` until `shutdown` flips to `true` or its
    /// sender is dropped. A failed pass is logged and retried next tick.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            event = "sweep.started",
            interval_secs = self.interval.as_secs(),
            batch_size = self.batch_size,
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match self.run_once().await {
                Ok(report) if report.removed > 0 || report.failed > 0 => {
                    tracing::info!(
                        event = "sweep.completed",
                        scanned = report.scanned,
                        removed = report.removed,
                        failed = report.failed,
                    );
                }
                Ok(report) => {
                    tracing::debug!(event = "sweep.completed", scanned = report.scanned);
                }
                Err(e) => {
                    tracing::warn!(event = "sweep.failed", error = %e);
                }
            }
        }

        tracing::info!(event = "sweep.stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
