//! Reconciliation Error Types

use std::time::Duration;

use thiserror::Error;

use crate::accrual::AccrualError;

/// Queue store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Caller contract violation: the order is already queued
    #[error("Order {0} is already queued")]
    DuplicateKey(String),

    #[error("Queue entry {order_id} has unknown status id {status_id}")]
    UnknownStatusId { order_id: String, status_id: i16 },

    #[error("Database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for QueueError {
    fn from(e: sqlx::Error) -> Self {
        QueueError::Database(e.to_string())
    }
}

/// Order/ledger store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Order {order_id} has unknown status id {status_id}")]
    UnknownStatusId { order_id: String, status_id: i16 },

    #[error("Database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        LedgerError::Database(e.to_string())
    }
}

/// Errors that end a worker tick
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Accrual error: {0}")]
    Accrual(#[from] AccrualError),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
}

impl ReconcileError {
    /// Fatal errors stop the worker; everything else is retried on the next tick.
    ///
    /// Only a non-transient accrual failure is fatal. Storage trouble is
    /// assumed to clear up, and rate limits are handled before they get here.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReconcileError::Accrual(e) if !e.is_transient())
    }

    pub fn code(&self) -> &'static str {
        match self {
            ReconcileError::Queue(QueueError::DuplicateKey(_)) => "DUPLICATE_KEY",
            ReconcileError::Queue(_) => "QUEUE_ERROR",
            ReconcileError::Ledger(LedgerError::OrderNotFound(_)) => "ORDER_NOT_FOUND",
            ReconcileError::Ledger(_) => "LEDGER_ERROR",
            ReconcileError::Accrual(e) => e.code(),
            ReconcileError::Timeout { .. } => "STORAGE_TIMEOUT",
        }
    }
}

/// Order submission errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntakeError {
    #[error("Invalid order number: {0}")]
    InvalidNumber(String),

    #[error("Order {0} was already submitted by another user")]
    OwnedByAnotherUser(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl IntakeError {
    /// Get HTTP status code suggestion for the request layer
    pub fn http_status(&self) -> u16 {
        match self {
            IntakeError::InvalidNumber(_) => 422,
            IntakeError::OwnedByAnotherUser(_) => 409,
            IntakeError::Queue(QueueError::DuplicateKey(_)) => 409,
            IntakeError::Queue(_) | IntakeError::Ledger(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_upstream_failures_are_fatal() {
        let transport = ReconcileError::from(AccrualError::Transport("reset".into()));
        assert!(transport.is_fatal());

        let status = ReconcileError::from(AccrualError::UnexpectedStatus(502));
        assert!(status.is_fatal());

        let limited = ReconcileError::from(AccrualError::RateLimited { retry_after: None });
        assert!(!limited.is_fatal());

        let storage = ReconcileError::from(QueueError::Database("connection reset".into()));
        assert!(!storage.is_fatal());

        let timeout = ReconcileError::Timeout {
            operation: "acquire",
            timeout: Duration::from_secs(5),
        };
        assert!(!timeout.is_fatal());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ReconcileError::from(QueueError::DuplicateKey("1".into())).code(),
            "DUPLICATE_KEY"
        );
        assert_eq!(
            ReconcileError::from(LedgerError::OrderNotFound("1".into())).code(),
            "ORDER_NOT_FOUND"
        );
        assert_eq!(
            ReconcileError::from(AccrualError::Decode("eof".into())).code(),
            "ACCRUAL_DECODE"
        );
    }

    #[test]
    fn test_intake_http_status() {
        assert_eq!(IntakeError::InvalidNumber("x".into()).http_status(), 422);
        assert_eq!(IntakeError::OwnedByAnotherUser("1".into()).http_status(), 409);
        assert_eq!(
            IntakeError::Ledger(LedgerError::Database("down".into())).http_status(),
            500
        );
    }

    #[test]
    fn test_display() {
        let err = ReconcileError::Timeout {
            operation: "delete",
            timeout: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "delete timed out after 1.5s");
    }
}
