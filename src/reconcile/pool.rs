//! Worker Pool
//!
//! Owns the reconciliation workers and the lease sweeper. All tasks share one
//! shutdown signal; `shutdown` waits for each of them and reports how they
//! ended. A worker that fails is not restarted, and the remaining workers keep
//! draining the queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::error::ReconcileError;
use super::ledger::OrderLedgerStore;
use super::queue::QueueStore;
use super::recovery::{LeaseSweeper, SweeperConfig};
use super::worker::{ReconcileWorker, WorkerConfig};
use crate::accrual::AccrualClient;

/// Cooperative shutdown flag shared by every pool task
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Ask every subscriber to stop. Idempotent.
    pub fn request_shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Pool configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of concurrent workers
    pub workers: usize,
    pub worker: WorkerConfig,
    pub sweeper: SweeperConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            worker: WorkerConfig::default(),
            sweeper: SweeperConfig::default(),
        }
    }
}

/// A worker that stopped with an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFailure {
    pub worker_id: usize,
    pub error: String,
}

/// How the pool's workers ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub clean_exits: usize,
    pub failures: Vec<WorkerFailure>,
}

impl PoolReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Holds one slot of the active-worker count; released on drop, so a
/// panicking worker task is uncounted too.
struct ActiveSlot(Arc<AtomicUsize>);

impl ActiveSlot {
    fn remaining(self) -> usize {
        let counter = self.0.clone();
        drop(self);
        counter.load(Ordering::SeqCst)
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Running set of reconciliation workers
pub struct WorkerPool {
    shutdown: ShutdownSignal,
    workers: Vec<JoinHandle<Result<(), ReconcileError>>>,
    sweeper: JoinHandle<()>,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Spawn `config.workers` workers and the lease sweeper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: PoolConfig,
        queue: Arc<dyn QueueStore>,
        ledger: Arc<dyn OrderLedgerStore>,
        accrual: Arc<dyn AccrualClient>,
    ) -> Self {
        let shutdown = ShutdownSignal::new();
        let active = Arc::new(AtomicUsize::new(config.workers));

        info!(
            workers = config.workers,
            lock_lease_secs = config.sweeper.lock_lease.as_secs(),
            "Starting reconciliation pool"
        );

        let workers = (0..config.workers)
            .map(|id| {
                let worker = ReconcileWorker::new(
                    id,
                    queue.clone(),
                    ledger.clone(),
                    accrual.clone(),
                    config.worker.clone(),
                );
                let rx = shutdown.subscribe();
                let slot = ActiveSlot(active.clone());

                tokio::spawn(async move {
                    let result = worker.run(rx).await;
                    let remaining = slot.remaining();
                    if let Err(e) = &result {
                        error!(
                            worker_id = worker.id(),
                            remaining_workers = remaining,
                            error = %e,
                            "Reconciliation worker failed"
                        );
                    }
                    result
                })
            })
            .collect();

        let sweeper = {
            let sweeper = LeaseSweeper::new(queue, config.sweeper);
            let rx = shutdown.subscribe();
            tokio::spawn(async move { sweeper.run(rx).await })
        };

        Self {
            shutdown,
            workers,
            sweeper,
            active,
        }
    }

    /// Configured number of workers
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Workers still running
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Signal shutdown and wait for every task to finish its current tick.
    pub async fn shutdown(self) -> PoolReport {
        info!(active_workers = self.active_workers(), "Stopping reconciliation pool");
        self.shutdown.request_shutdown();

        let mut report = PoolReport::default();
        let results = join_all(self.workers).await;

        for (worker_id, result) in results.into_iter().enumerate() {
            match result {
                Ok(Ok(())) => report.clean_exits += 1,
                Ok(Err(e)) => report.failures.push(WorkerFailure {
                    worker_id,
                    error: e.to_string(),
                }),
                Err(join_err) if join_err.is_panic() => {
                    error!(worker_id, "Reconciliation worker panicked");
                    report.failures.push(WorkerFailure {
                        worker_id,
                        error: format!("worker task panicked: {}", join_err),
                    })
                }
                Err(join_err) => report.failures.push(WorkerFailure {
                    worker_id,
                    error: format!("worker task aborted: {}", join_err),
                }),
            }
        }

        if let Err(e) = self.sweeper.await {
            warn!(error = %e, "Lease sweeper task aborted");
        }

        info!(
            clean_exits = report.clean_exits,
            failures = report.failures.len(),
            "Reconciliation pool stopped"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accrual::{AccrualError, AccrualOrder};
    use async_trait::async_trait;
    use crate::reconcile::memory::{
        InMemoryOrderLedger, InMemoryQueueStore, ScriptedAccrualClient,
    };
    use crate::reconcile::state::OrderStatus;
    use rust_decimal::Decimal;
    use std::time::Duration;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.workers, 2);
        assert_eq!(config.worker, WorkerConfig::default());
        assert_eq!(config.sweeper, SweeperConfig::default());
    }

    #[test]
    fn test_shutdown_signal() {
        let signal = ShutdownSignal::new();
        let rx = signal.subscribe();
        assert!(!signal.is_shutdown_requested());

        signal.request_shutdown();
        signal.request_shutdown();
        assert!(signal.is_shutdown_requested());
        assert!(*rx.borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_drains_queue_and_shuts_down_clean() {
        let queue = InMemoryQueueStore::new();
        let ledger = InMemoryOrderLedger::new();
        let accrual = ScriptedAccrualClient::new();

        for (i, order_id) in ["1", "2", "3"].into_iter().enumerate() {
            ledger.register_order(order_id, 1).await.unwrap();
            queue.add(order_id).await.unwrap();
            accrual
                .push_status(order_id, "PROCESSED", Some(Decimal::from(i as i64 + 1)))
                .await;
        }

        let pool = WorkerPool::start(
            PoolConfig::default(),
            Arc::new(queue.clone()),
            Arc::new(ledger.clone()),
            Arc::new(accrual.clone()),
        );
        assert_eq!(pool.size(), 2);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(pool.active_workers(), 2);

        let report = pool.shutdown().await;
        assert!(report.is_clean());
        assert_eq!(report.clean_exits, 2);
        assert_eq!(queue.pending_count().await.unwrap(), 0);
        assert_eq!(ledger.accrual_records().await.len(), 3);
        for order_id in ["1", "2", "3"] {
            let order = ledger.find_order(order_id).await.unwrap().unwrap();
            assert_eq!(order.status, OrderStatus::Processed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_worker_is_reported_and_others_keep_running() {
        let queue = InMemoryQueueStore::new();
        let ledger = InMemoryOrderLedger::new();
        let accrual = ScriptedAccrualClient::new();

        ledger.register_order("bad", 1).await.unwrap();
        queue.add("bad").await.unwrap();
        accrual
            .push("bad", Err(AccrualError::Transport("connection refused".into())))
            .await;

        let pool = WorkerPool::start(
            PoolConfig::default(),
            Arc::new(queue.clone()),
            Arc::new(ledger.clone()),
            Arc::new(accrual.clone()),
        );

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(pool.active_workers(), 1);

        // The survivor still processes new work
        ledger.register_order("good", 1).await.unwrap();
        queue.add("good").await.unwrap();
        accrual.push_status("good", "INVALID", None).await;
        tokio::time::sleep(Duration::from_secs(3)).await;

        let good = ledger.find_order("good").await.unwrap().unwrap();
        assert_eq!(good.status, OrderStatus::Invalid);

        let report = pool.shutdown().await;
        assert_eq!(report.clean_exits, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].error.contains("connection refused"));

        let bad = queue.entry("bad").await.unwrap();
        assert!(!bad.locked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_leaves_nothing_locked() {
        let queue = InMemoryQueueStore::new();
        let ledger = InMemoryOrderLedger::new();
        let accrual = ScriptedAccrualClient::new();
        accrual.set_latency(Duration::from_millis(800)).await;

        for i in 0..6 {
            let order_id = i.to_string();
            ledger.register_order(&order_id, 1).await.unwrap();
            queue.add(&order_id).await.unwrap();
            accrual.push_status(&order_id, "PROCESSING", None).await;
        }

        let pool = WorkerPool::start(
            PoolConfig::default(),
            Arc::new(queue.clone()),
            Arc::new(ledger.clone()),
            Arc::new(accrual.clone()),
        );

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let report = pool.shutdown().await;
        assert!(report.is_clean());

        for entry in queue.entries().await {
            assert!(!entry.locked, "{} left locked", entry.order_id);
        }
    }

    struct PanickingAccrual;

    #[async_trait]
    impl AccrualClient for PanickingAccrual {
        async fn get_order_info(
            &self,
            order_id: &str,
        ) -> Result<Option<AccrualOrder>, AccrualError> {
            panic!("accrual client blew up on {}", order_id);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_worker_leaves_active_count() {
        let queue = InMemoryQueueStore::new();
        let ledger = InMemoryOrderLedger::new();

        ledger.register_order("boom", 1).await.unwrap();
        queue.add("boom").await.unwrap();

        let pool = WorkerPool::start(
            PoolConfig::default(),
            Arc::new(queue.clone()),
            Arc::new(ledger.clone()),
            Arc::new(PanickingAccrual),
        );

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(pool.active_workers(), 1);

        let report = pool.shutdown().await;
        assert_eq!(report.clean_exits, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].error.contains("panicked"));
    }
}
