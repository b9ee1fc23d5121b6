//! Order and Accrual Ledger Store
//!
//! `user_order` holds the authoritative order status; `accrual_ledger` is the
//! append-only list of credited accruals that balances are computed from.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use super::error::LedgerError;
use super::state::OrderStatus;

/// Outcome of registering a submitted order number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// New order, owned by the submitting user
    Registered,
    /// The same user already submitted this number
    AlreadyOwned,
    /// Another user owns this number
    OwnedByOther,
}

/// An order as seen by the request layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRecord {
    pub id: String,
    pub user_id: i64,
    pub status: OrderStatus,
    /// Credited amount; present once the order reached PROCESSED
    pub accrual: Option<Decimal>,
    pub uploaded_at: DateTime<Utc>,
}

/// Order/ledger operations consumed by the reconciliation core
#[async_trait]
pub trait OrderLedgerStore: Send + Sync {
    async fn register_order(
        &self,
        order_id: &str,
        user_id: i64,
    ) -> Result<Registration, LedgerError>;

    async fn find_order(&self, order_id: &str) -> Result<Option<OrderRecord>, LedgerError>;

    async fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
    ) -> Result<(), LedgerError>;

    /// Credit `amount` to the order's owner.
    ///
    /// Idempotent per order: replaying the write after a crash between the
    /// ledger insert and the queue delete must not credit twice.
    async fn add_accrual_record(&self, order_id: &str, amount: Decimal)
    -> Result<(), LedgerError>;
}

/// [`OrderLedgerStore`] over PostgreSQL
#[derive(Clone)]
pub struct PgOrderLedger {
    pool: PgPool,
}

impl PgOrderLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderLedgerStore for PgOrderLedger {
    async fn register_order(
        &self,
        order_id: &str,
        user_id: i64,
    ) -> Result<Registration, LedgerError> {
        let inserted = sqlx::query(
            r#"INSERT INTO user_order (id, user_id, status_id, uploaded_at)
               VALUES ($1, $2, $3, NOW())
               ON CONFLICT (id) DO NOTHING"#,
        )
        .bind(order_id)
        .bind(user_id)
        .bind(OrderStatus::New.id())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted > 0 {
            info!(order_id, user_id, "Order registered");
            return Ok(Registration::Registered);
        }

        let owner: Option<i64> = sqlx::query_scalar("SELECT user_id FROM user_order WHERE id = $1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;

        match owner {
            Some(owner) if owner == user_id => Ok(Registration::AlreadyOwned),
            Some(_) => Ok(Registration::OwnedByOther),
            None => Err(LedgerError::OrderNotFound(order_id.to_string())),
        }
    }

    async fn find_order(&self, order_id: &str) -> Result<Option<OrderRecord>, LedgerError> {
        let row = sqlx::query(
            r#"SELECT o.id, o.user_id, o.status_id, o.uploaded_at, l.amount AS accrual
               FROM user_order o
               LEFT JOIN accrual_ledger l ON l.order_id = o.id
               WHERE o.id = $1"#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status_id: i16 = row.try_get("status_id")?;
        let status =
            OrderStatus::from_id(status_id).ok_or_else(|| LedgerError::UnknownStatusId {
                order_id: order_id.to_string(),
                status_id,
            })?;

        Ok(Some(OrderRecord {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            status,
            accrual: row.try_get("accrual")?,
            uploaded_at: row.try_get("uploaded_at")?,
        }))
    }

    async fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query("UPDATE user_order SET status_id = $1 WHERE id = $2")
            .bind(status.id())
            .bind(order_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::OrderNotFound(order_id.to_string()));
        }
        Ok(())
    }

    async fn add_accrual_record(
        &self,
        order_id: &str,
        amount: Decimal,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"INSERT INTO accrual_ledger (order_id, amount, processed_at)
               VALUES ($1, $2, NOW())
               ON CONFLICT (order_id) DO NOTHING"#,
        )
        .bind(order_id)
        .bind(amount)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            let missing_order = e
                .as_database_error()
                .is_some_and(|db| db.is_foreign_key_violation());
            if missing_order {
                LedgerError::OrderNotFound(order_id.to_string())
            } else {
                LedgerError::from(e)
            }
        })?;

        if result.rows_affected() == 0 {
            debug!(order_id, "Accrual already recorded, skipping");
        } else {
            info!(order_id, amount = %amount, "Accrual recorded");
        }
        Ok(())
    }
}
