//! Accrual Reconciliation
//!
//! Keeps order statuses and the accrual ledger in step with the external
//! accrual service.
//!
//! # Architecture
//!
//! ```text
//! OrderIntake ──add──▶ accrual_queue ◀──acquire/release/delete── ReconcileWorker × N
//!                                                                      │
//!                                               AccrualClient ◀──poll──┤
//!                                          OrderLedgerStore ◀──persist─┘
//! ```
//!
//! # State Machine
//!
//! ```text
//! NEW → REGISTERED → PROCESSING → PROCESSED
//!   ↘        ↘            ↘
//!                 INVALID
//! ```
//!
//! # Invariants
//!
//! 1. **Exclusive claim**: a locked queue entry is held by exactly one worker
//! 2. **Write-then-delete**: a terminal entry leaves the queue only after the
//!    order status (and, for PROCESSED, the ledger record) is committed
//! 3. **Never stuck**: every claim ends in release or delete; a crashed
//!    holder's claim is recovered by the lease sweeper

pub mod error;
pub mod intake;
pub mod ledger;
pub mod memory;
pub mod pool;
pub mod queue;
pub mod recovery;
pub mod state;
pub mod worker;

pub use error::{IntakeError, LedgerError, QueueError, ReconcileError};
pub use intake::{Enqueued, OrderIntake};
pub use ledger::{OrderLedgerStore, OrderRecord, PgOrderLedger, Registration};
pub use pool::{PoolConfig, PoolReport, ShutdownSignal, WorkerFailure, WorkerPool};
pub use queue::{ClaimedTask, PgQueueStore, QueueEntry, QueueStore};
pub use recovery::{LeaseSweeper, SweeperConfig};
pub use state::OrderStatus;
pub use worker::{ReconcileWorker, TickOutcome, WorkerConfig};
