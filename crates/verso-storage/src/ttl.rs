use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;

use crate::traits::TableStore;

/// Sweep interval used when none is configured.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Periodically removes version and index rows whose TTL has elapsed.
///
/// Expiry is a storage concern: rows written with `expires_at_ms` are purged
/// here without any entity-layer involvement, so an expired version leaves
/// no index rows behind that point at it, and vice versa.
pub struct TtlSweeper<S: TableStore> {
    tables: Arc<S>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl<S: TableStore> TtlSweeper<S> {
    pub fn new(tables: Arc<S>, interval: Duration, shutdown: watch::Receiver<bool>) -> Self {
        TtlSweeper { tables, interval, shutdown }
    }

    /// One purge pass at `now_ms`; returns the number of rows removed.
    pub async fn sweep_once(&self, now_ms: i64) -> usize {
        match self.tables.purge_expired(now_ms).await {
            Ok(0) => 0,
            Ok(n) => {
                tracing::debug!(removed = n, "ttl sweep");
                n
            }
            Err(e) => {
                tracing::warn!(error = %e, "ttl sweep failed");
                0
            }
        }
    }

    /// Run until the shutdown flag flips to `true` or its sender is dropped.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.sweep_once(now_ms()).await;
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("ttl sweeper stopped");
    }
}
