//! Periodic pruner
//!
//! One ticker per pruned table. Each tick queues a single DELETE for
//! rows older than the retention window. The first tick fires one full
//! interval after start; startup never prunes.

use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::params;
use tracing::{debug, info};

use crate::Store;

/// Default ticker period
pub const DEFAULT_PRUNE_INTERVAL: std::time::Duration =
    std::time::Duration::from_secs(24 * 60 * 60);

/// Which table a pruner sweeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneTarget {
    Metrics,
    Logs,
}

impl PruneTarget {
    fn table(&self) -> &'static str {
        match self {
            PruneTarget::Metrics => "metrics",
            PruneTarget::Logs => "logs",
        }
    }

    /// Retention defaults: metrics 90 days, logs 7 days
    pub fn default_retention(&self) -> ChronoDuration {
        match self {
            PruneTarget::Metrics => ChronoDuration::days(90),
            PruneTarget::Logs => ChronoDuration::days(7),
        }
    }
}

/// A running prune loop; aborted on drop
pub struct Pruner {
    task: tokio::task::JoinHandle<()>,
}

impl Pruner {
    pub fn spawn(
        store: Store,
        target: PruneTarget,
        interval: std::time::Duration,
        retention: ChronoDuration,
    ) -> Self {
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let cutoff = Utc::now() - retention;
                debug!(table = target.table(), cutoff = %cutoff, "pruning");

                store.enqueue_write(Box::new(move |conn| {
                    let deleted = conn.execute(
                        &format!("DELETE FROM {} WHERE timestamp < ?1", target.table()),
                        params![cutoff],
                    )?;
                    if deleted > 0 {
                        info!(table = target.table(), deleted, "pruned old rows");
                    }
                    Ok(())
                }));
            }
        });

        Self { task }
    }

    /// Spawn with the target's default retention
    pub fn spawn_default(store: Store, target: PruneTarget, interval: std::time::Duration) -> Self {
        Self::spawn(store, target, interval, target.default_retention())
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for Pruner {
    fn drop(&mut self) {
        self.stop();
    }
}
