//! Database connection management

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::DatabaseConfig;

/// Schema used by the order ledger and the accrual queue. Every statement is
/// idempotent so `migrate` can run on each start.
const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS user_order (
        id          TEXT PRIMARY KEY,
        user_id     BIGINT NOT NULL,
        status_id   SMALLINT NOT NULL DEFAULT 1 CHECK (status_id BETWEEN 1 AND 5),
        uploaded_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    "CREATE INDEX IF NOT EXISTS user_order_user_idx ON user_order (user_id, uploaded_at)",
    r#"CREATE TABLE IF NOT EXISTS accrual_ledger (
        id           BIGSERIAL PRIMARY KEY,
        order_id     TEXT NOT NULL UNIQUE REFERENCES user_order (id),
        amount       NUMERIC NOT NULL CHECK (amount >= 0),
        processed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS accrual_queue (
        order_id   TEXT PRIMARY KEY,
        status_id  SMALLINT NOT NULL DEFAULT 1 CHECK (status_id BETWEEN 1 AND 5),
        is_locked  BOOLEAN NOT NULL DEFAULT FALSE,
        locked_at  TIMESTAMPTZ NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE INDEX IF NOT EXISTS accrual_queue_claim_idx
        ON accrual_queue (updated_at) WHERE NOT is_locked"#,
];

/// PostgreSQL database connection pool
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
            .connect(&config.url)
            .await?;

        tracing::info!(
            max_connections = config.max_connections,
            "PostgreSQL connection pool established"
        );
        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Create tables and indexes if they do not exist yet
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        for &statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::info!(statements = SCHEMA.len(), "Database schema ready");
        Ok(())
    }

    /// Close every pooled connection, waiting for checked-out ones to return
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("PostgreSQL connection pool closed");
    }
}
