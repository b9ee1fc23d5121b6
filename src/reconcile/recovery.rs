//! Lease Sweeper
//!
//! Background task that unlocks queue entries whose claim outlived the lease,
//! e.g. after a worker process crashed between `acquire` and release.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::error::QueueError;
use super::queue::QueueStore;

/// Configuration for the lease sweeper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweeperConfig {
    /// How often to look for expired claims
    pub sweep_interval: Duration,
    /// How long a claim may be held before it is considered abandoned
    pub lock_lease: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            lock_lease: Duration::from_secs(60),
        }
    }
}

/// Lease Sweeper
pub struct LeaseSweeper {
    queue: Arc<dyn QueueStore>,
    config: SweeperConfig,
}

impl LeaseSweeper {
    pub fn new(queue: Arc<dyn QueueStore>, config: SweeperConfig) -> Self {
        Self { queue, config }
    }

    /// Sweep periodically until shutdown is requested.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            lock_lease_secs = self.config.lock_lease.as_secs(),
            "Starting lease sweeper"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.sweep_interval) => {
                    if let Err(e) = self.sweep_once().await {
                        warn!(error = %e, "Lease sweep failed");
                    }
                }
            }
        }

        debug!("Lease sweeper stopped");
    }

    /// Run a single sweep. Returns the number of entries unlocked.
    pub async fn sweep_once(&self) -> Result<u64, QueueError> {
        let released = self.queue.release_expired(self.config.lock_lease).await?;

        if released > 0 {
            warn!(
                count = released,
                lock_lease_secs = self.config.lock_lease.as_secs(),
                "Released abandoned queue claims"
            );
        } else {
            debug!("No expired claims");
        }

        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::memory::InMemoryQueueStore;

    #[test]
    fn test_sweeper_config_default() {
        let config = SweeperConfig::default();
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
        assert_eq!(config.lock_lease, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_once_unlocks_abandoned_claim() {
        let queue = InMemoryQueueStore::new();
        queue.add("A1").await.unwrap();
        queue.acquire().await.unwrap().unwrap();

        let sweeper = LeaseSweeper::new(Arc::new(queue.clone()), SweeperConfig::default());
        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(sweeper.sweep_once().await.unwrap(), 1);
        assert!(!queue.entry("A1").await.unwrap().locked);
        assert!(queue.acquire().await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_recovers_claim_and_stops() {
        let queue = InMemoryQueueStore::new();
        queue.add("A1").await.unwrap();
        queue.acquire().await.unwrap().unwrap();

        let sweeper = LeaseSweeper::new(
            Arc::new(queue.clone()),
            SweeperConfig {
                sweep_interval: Duration::from_secs(10),
                lock_lease: Duration::from_secs(25),
            },
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { sweeper.run(rx).await });

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert!(!queue.entry("A1").await.unwrap().locked);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
