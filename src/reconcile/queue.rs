//! Accrual Queue Store
//!
//! PostgreSQL-backed list of orders still waiting for a final accrual status.
//! Cross-process mutual exclusion comes from the claim query alone:
//! `FOR UPDATE SKIP LOCKED` hands each caller a different row and never makes
//! one claim wait on another.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use super::error::QueueError;
use super::state::OrderStatus;

/// A queue entry held by exactly one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedTask {
    pub order_id: String,
    pub status: OrderStatus,
}

/// One row of `accrual_queue`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub order_id: String,
    pub status: OrderStatus,
    pub locked: bool,
    /// When the current claim was taken; `None` while unlocked
    pub locked_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Queue store operations
///
/// Implementations must guarantee that concurrent [`acquire`](Self::acquire)
/// calls never hand out the same entry while it is locked.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert `order_id` at NEW, unlocked.
    ///
    /// Fails with [`QueueError::DuplicateKey`] if it is already queued.
    async fn add(&self, order_id: &str) -> Result<(), QueueError>;

    /// Lock and return the oldest unlocked claimable entry, if any.
    async fn acquire(&self) -> Result<Option<ClaimedTask>, QueueError>;

    /// Unlock the entry, set its status and refresh `updated_at`.
    ///
    /// Passing the claimed status back releases the entry unchanged.
    async fn update_status_and_release(
        &self,
        order_id: &str,
        status: OrderStatus,
    ) -> Result<(), QueueError>;

    /// Remove the entry. Only call once the order/ledger write has committed.
    async fn delete(&self, order_id: &str) -> Result<(), QueueError>;

    /// Unlock entries claimed longer than `lease` ago. Returns how many.
    async fn release_expired(&self, lease: Duration) -> Result<u64, QueueError>;

    /// Number of queued entries, locked or not
    async fn pending_count(&self) -> Result<u64, QueueError>;
}

const ADD_QUERY: &str = r#"
INSERT INTO accrual_queue (order_id, status_id, is_locked, updated_at)
VALUES ($1, $2, FALSE, NOW())
"#;

const ACQUIRE_QUERY: &str = r#"
UPDATE accrual_queue
SET is_locked = TRUE, locked_at = NOW()
WHERE order_id = (
    SELECT order_id
    FROM accrual_queue
    WHERE status_id = ANY($1) AND is_locked = FALSE
    ORDER BY updated_at
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
RETURNING order_id, status_id
"#;

const UPDATE_AND_RELEASE_QUERY: &str = r#"
UPDATE accrual_queue
SET is_locked = FALSE, locked_at = NULL, status_id = $1, updated_at = NOW()
WHERE order_id = $2
"#;

const DELETE_QUERY: &str = "DELETE FROM accrual_queue WHERE order_id = $1";

const RELEASE_EXPIRED_QUERY: &str = r#"
UPDATE accrual_queue
SET is_locked = FALSE, locked_at = NULL
WHERE is_locked = TRUE
  AND locked_at < NOW() - make_interval(secs => $1)
"#;

/// [`QueueStore`] over the `accrual_queue` table
#[derive(Clone)]
pub struct PgQueueStore {
    pool: PgPool,
}

impl PgQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Read a single entry, for diagnostics and tests
    pub async fn entry(&self, order_id: &str) -> Result<Option<QueueEntry>, QueueError> {
        let row = sqlx::query(
            r#"SELECT order_id, status_id, is_locked, locked_at, updated_at
               FROM accrual_queue WHERE order_id = $1"#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status_id: i16 = row.try_get("status_id")?;
        Ok(Some(QueueEntry {
            order_id: row.try_get("order_id")?,
            status: decode_status(order_id, status_id)?,
            locked: row.try_get("is_locked")?,
            locked_at: row.try_get("locked_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }
}

fn decode_status(order_id: &str, status_id: i16) -> Result<OrderStatus, QueueError> {
    OrderStatus::from_id(status_id).ok_or_else(|| QueueError::UnknownStatusId {
        order_id: order_id.to_string(),
        status_id,
    })
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn add(&self, order_id: &str) -> Result<(), QueueError> {
        sqlx::query(ADD_QUERY)
            .bind(order_id)
            .bind(OrderStatus::New.id())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                let duplicate = e
                    .as_database_error()
                    .is_some_and(|db| db.is_unique_violation());
                if duplicate {
                    QueueError::DuplicateKey(order_id.to_string())
                } else {
                    QueueError::from(e)
                }
            })?;

        tracing::debug!(order_id, "Order queued for accrual polling");
        Ok(())
    }

    async fn acquire(&self) -> Result<Option<ClaimedTask>, QueueError> {
        let row = sqlx::query(ACQUIRE_QUERY)
            .bind(OrderStatus::claimable_ids())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let order_id: String = row.try_get("order_id")?;
        let status_id: i16 = row.try_get("status_id")?;
        let status = decode_status(&order_id, status_id)?;

        Ok(Some(ClaimedTask { order_id, status }))
    }

    async fn update_status_and_release(
        &self,
        order_id: &str,
        status: OrderStatus,
    ) -> Result<(), QueueError> {
        sqlx::query(UPDATE_AND_RELEASE_QUERY)
            .bind(status.id())
            .bind(order_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, order_id: &str) -> Result<(), QueueError> {
        sqlx::query(DELETE_QUERY)
            .bind(order_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release_expired(&self, lease: Duration) -> Result<u64, QueueError> {
        let result = sqlx::query(RELEASE_EXPIRED_QUERY)
            .bind(lease.as_secs_f64())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn pending_count(&self) -> Result<u64, QueueError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM accrual_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}
