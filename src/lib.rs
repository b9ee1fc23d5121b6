//! Gophermart - Loyalty Accrual Reconciliation
//!
//! Submitted orders are queued in PostgreSQL and polled against an external
//! accrual service until they reach a final status; processed orders credit
//! the user's accrual ledger.
//!
//! # Modules
//!
//! - [`order_number`] - Luhn-checked order numbers
//! - [`accrual`] - HTTP client for the accrual service
//! - [`reconcile`] - Queue, ledger, workers and the worker pool
//! - [`db`] - PostgreSQL pool and schema
//! - [`config`] - YAML configuration
//! - [`logging`] - tracing subscriber setup

pub mod accrual;
pub mod config;
pub mod db;
pub mod logging;
pub mod order_number;
pub mod reconcile;

// Convenient re-exports at crate root
pub use accrual::{AccrualClient, AccrualError, AccrualOrder, HttpAccrualClient};
pub use config::{AppConfig, ConfigError, Overrides};
pub use db::Database;
pub use order_number::OrderNumber;
pub use reconcile::{
    Enqueued, OrderIntake, OrderStatus, PgOrderLedger, PgQueueStore, PoolConfig, PoolReport,
    ReconcileError, ShutdownSignal, WorkerPool,
};
