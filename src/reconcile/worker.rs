//! Reconciliation Worker
//!
//! One worker drains the accrual queue on a fixed interval. Each tick claims
//! at most one order, asks the accrual service about it and either releases
//! the claim (possibly with a new status) or removes the finished order.
//!
//! # Tick outcomes
//!
//! | Accrual reply           | Order record | Queue entry                 |
//! |-------------------------|--------------|-----------------------------|
//! | 429                     | untouched    | released unchanged, cooldown |
//! | 204 / unknown label     | untouched    | released unchanged          |
//! | NEW/REGISTERED/PROCESSING | status set | released with new status    |
//! | PROCESSED               | status set, accrual credited | deleted    |
//! | INVALID                 | status set   | deleted                     |
//! | transport failure       | untouched    | released unchanged, worker exits |

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval, sleep, timeout};
use tracing::{debug, error, info, trace, warn};

use super::error::ReconcileError;
use super::ledger::OrderLedgerStore;
use super::queue::{ClaimedTask, QueueStore};
use super::state::OrderStatus;
use crate::accrual::{AccrualClient, AccrualError, AccrualOrder};

/// Configuration for a reconciliation worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Time between claim attempts
    pub tick_interval: Duration,
    /// Pause after the accrual service rate-limited this worker
    pub rate_limit_cooldown: Duration,
    /// Upper bound for a `Retry-After` requested pause
    pub max_rate_limit_cooldown: Duration,
    /// Upper bound for every storage call and the accrual request
    pub call_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            rate_limit_cooldown: Duration::from_secs(5),
            max_rate_limit_cooldown: Duration::from_secs(60),
            call_timeout: Duration::from_secs(5),
        }
    }
}

impl WorkerConfig {
    /// Cooldown for a 429: the configured pause, stretched to `Retry-After`
    /// but never past `max_rate_limit_cooldown`.
    pub fn cooldown_for(&self, retry_after: Option<Duration>) -> Duration {
        let floor = self.rate_limit_cooldown;
        let ceiling = self.max_rate_limit_cooldown.max(floor);
        retry_after.map_or(floor, |after| after.max(floor).min(ceiling))
    }
}

/// What a single tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing claimable
    Idle,
    /// Released without a status change; polled again later
    Deferred { order_id: String },
    /// Released with the status the accrual service reported
    Advanced {
        order_id: String,
        status: OrderStatus,
    },
    /// Terminal status persisted and entry removed from the queue
    Completed {
        order_id: String,
        status: OrderStatus,
    },
    /// Released unchanged; the worker must sit out `cooldown`
    RateLimited {
        order_id: String,
        cooldown: Duration,
    },
}

/// Reconciliation worker
pub struct ReconcileWorker {
    id: usize,
    queue: Arc<dyn QueueStore>,
    ledger: Arc<dyn OrderLedgerStore>,
    accrual: Arc<dyn AccrualClient>,
    config: WorkerConfig,
}

impl ReconcileWorker {
    pub fn new(
        id: usize,
        queue: Arc<dyn QueueStore>,
        ledger: Arc<dyn OrderLedgerStore>,
        accrual: Arc<dyn AccrualClient>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id,
            queue,
            ledger,
            accrual,
            config,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Run the worker loop until `shutdown` turns true or a fatal error occurs.
    ///
    /// Shutdown is only observed between ticks (and during a rate-limit
    /// cooldown); a tick that has started always runs to completion.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ReconcileError> {
        info!(
            worker_id = self.id,
            tick_ms = self.config.tick_interval.as_millis() as u64,
            cooldown_ms = self.config.rate_limit_cooldown.as_millis() as u64,
            "Starting reconciliation worker"
        );

        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            match self.tick().await {
                Ok(TickOutcome::Idle) => trace!(worker_id = self.id, "Queue empty"),
                Ok(TickOutcome::RateLimited { order_id, cooldown }) => {
                    debug!(
                        worker_id = self.id,
                        order_id = %order_id,
                        cooldown_ms = cooldown.as_millis() as u64,
                        "Rate limited by accrual service, cooling down"
                    );
                    if self.cool_down(cooldown, &mut shutdown).await {
                        break;
                    }
                    ticker.reset();
                }
                Ok(outcome) => debug!(worker_id = self.id, ?outcome, "Tick finished"),
                Err(e) if e.is_fatal() => {
                    error!(
                        worker_id = self.id,
                        code = e.code(),
                        error = %e,
                        "Accrual service failure, stopping worker"
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        worker_id = self.id,
                        code = e.code(),
                        error = %e,
                        "Tick failed, retrying on next tick"
                    );
                }
            }
        }

        info!(worker_id = self.id, "Reconciliation worker stopped");
        Ok(())
    }

    /// Sleep out a cooldown. Returns true if shutdown was requested meanwhile.
    async fn cool_down(&self, cooldown: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        let pause = sleep(cooldown);
        tokio::pin!(pause);

        loop {
            tokio::select! {
                _ = &mut pause => return false,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return true;
                    }
                }
            }
        }
    }

    /// Run one claim/poll/persist cycle.
    ///
    /// On error the claimed entry is released unchanged before returning, so a
    /// failed tick never leaves an entry locked.
    pub async fn tick(&self) -> Result<TickOutcome, ReconcileError> {
        let Some(task) = self.bounded("acquire", self.queue.acquire()).await? else {
            return Ok(TickOutcome::Idle);
        };

        debug!(
            worker_id = self.id,
            order_id = %task.order_id,
            status = %task.status,
            "Claimed order"
        );

        match self.process(&task).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if let Err(release_err) = self.release(&task.order_id, task.status).await {
                    warn!(
                        worker_id = self.id,
                        order_id = %task.order_id,
                        error = %release_err,
                        "Failed to release claim after error; lease sweep will recover it"
                    );
                }
                Err(e)
            }
        }
    }

    async fn process(&self, task: &ClaimedTask) -> Result<TickOutcome, ReconcileError> {
        let order_id = task.order_id.as_str();

        let reply = match self.poll(order_id).await {
            Ok(reply) => reply,
            Err(AccrualError::RateLimited { retry_after }) => {
                self.release(order_id, task.status).await?;
                let cooldown = self.config.cooldown_for(retry_after);
                return Ok(TickOutcome::RateLimited {
                    order_id: order_id.to_string(),
                    cooldown,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let Some(AccrualOrder {
            status: label,
            accrual,
            ..
        }) = reply
        else {
            debug!(order_id, "Order not known to accrual service yet");
            self.release(order_id, task.status).await?;
            return Ok(TickOutcome::Deferred {
                order_id: order_id.to_string(),
            });
        };

        let status = match label.parse::<OrderStatus>() {
            Ok(status) => status,
            Err(e) => {
                warn!(order_id, error = %e, "Accrual service reported an unknown status");
                self.release(order_id, task.status).await?;
                return Ok(TickOutcome::Deferred {
                    order_id: order_id.to_string(),
                });
            }
        };

        if !task.status.can_transition_to(status) {
            warn!(
                order_id,
                from = %task.status,
                to = %status,
                "Accrual status moved backwards"
            );
        }

        self.bounded(
            "update_order_status",
            self.ledger.update_order_status(order_id, status),
        )
        .await?;

        match status {
            OrderStatus::Processed => {
                let amount = accrual.unwrap_or(Decimal::ZERO);
                self.bounded(
                    "add_accrual_record",
                    self.ledger.add_accrual_record(order_id, amount),
                )
                .await?;
                self.bounded("delete", self.queue.delete(order_id)).await?;

                info!(order_id, accrual = %amount, "Order processed");
                Ok(TickOutcome::Completed {
                    order_id: order_id.to_string(),
                    status,
                })
            }
            OrderStatus::Invalid => {
                self.bounded("delete", self.queue.delete(order_id)).await?;

                info!(order_id, "Order rejected by accrual service");
                Ok(TickOutcome::Completed {
                    order_id: order_id.to_string(),
                    status,
                })
            }
            OrderStatus::New | OrderStatus::Registered | OrderStatus::Processing => {
                self.release(order_id, status).await?;
                Ok(TickOutcome::Advanced {
                    order_id: order_id.to_string(),
                    status,
                })
            }
        }
    }

    async fn poll(&self, order_id: &str) -> Result<Option<AccrualOrder>, AccrualError> {
        match timeout(self.config.call_timeout, self.accrual.get_order_info(order_id)).await {
            Ok(reply) => reply,
            Err(_) => Err(AccrualError::Transport(format!(
                "request timed out after {:?}",
                self.config.call_timeout
            ))),
        }
    }

    async fn release(&self, order_id: &str, status: OrderStatus) -> Result<(), ReconcileError> {
        self.bounded(
            "update_status_and_release",
            self.queue.update_status_and_release(order_id, status),
        )
        .await
    }

    async fn bounded<T, E>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, E>>,
    ) -> Result<T, ReconcileError>
    where
        ReconcileError: From<E>,
    {
        match timeout(self.config.call_timeout, call).await {
            Ok(result) => result.map_err(ReconcileError::from),
            Err(_) => Err(ReconcileError::Timeout {
                operation,
                timeout: self.config.call_timeout,
            }),
        }
    }
}
