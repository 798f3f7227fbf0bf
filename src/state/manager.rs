//! PostgreSQL attempt journal

use crate::config::DatabaseConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::tx::TransactionRecord;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Sink for attempt snapshots
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AttemptJournal: Send + Sync {
    async fn record(&self, record: &TransactionRecord) -> RelayerResult<()>;
}

/// State manager for PostgreSQL persistence
pub struct StateManager {
    pool: PgPool,
}

impl StateManager {
    /// Create a new state manager
    pub async fn new(config: &DatabaseConfig) -> RelayerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Create the journal table if needed
    pub async fn run_migrations(&self) -> RelayerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tx_attempts (
                record_id UUID PRIMARY KEY,
                tx_id UUID NOT NULL,
                account VARCHAR(42) NOT NULL,
                nonce BIGINT NOT NULL,
                status VARCHAR(16) NOT NULL,
                retry_count INTEGER NOT NULL,
                ledger_handle TEXT,
                request JSONB NOT NULL,
                last_error JSONB,
                block TEXT,
                tx_hash TEXT,
                submitted_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_attempts_tx_id
            ON tx_attempts (tx_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Insert or refresh one attempt snapshot
    pub async fn upsert_attempt(&self, record: &TransactionRecord) -> RelayerResult<()> {
        let request = serde_json::to_value(&record.request)
            .map_err(|e| RelayerError::Internal(e.to_string()))?;
        let last_error = record
            .last_error
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| RelayerError::Internal(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO tx_attempts
                (record_id, tx_id, account, nonce, status, retry_count, ledger_handle,
                 request, last_error, block, tx_hash, submitted_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (record_id)
            DO UPDATE SET
                status = $5,
                ledger_handle = $7,
                last_error = $9,
                block = $10,
                tx_hash = $11,
                submitted_at = $12,
                updated_at = $14
            "#,
        )
        .bind(record.id)
        .bind(record.tx_id)
        .bind(format!("{:?}", record.account))
        .bind(record.nonce as i64)
        .bind(record.status.as_str())
        .bind(record.retry_count as i32)
        .bind(record.handle.as_ref().map(|h| h.to_string()))
        .bind(request)
        .bind(last_error)
        .bind(record.confirmation.as_ref().map(|c| c.block.clone()))
        .bind(record.confirmation.as_ref().map(|c| c.tx_hash.clone()))
        .bind(record.submitted_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        debug!(record_id = %record.id, status = %record.status, "Journaled attempt");
        Ok(())
    }

    /// Count journaled attempts per status
    pub async fn attempt_counts(&self) -> RelayerResult<Vec<(String, u64)>> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM tx_attempts
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get::<String, _>("status"),
                    row.get::<i64, _>("count") as u64,
                )
            })
            .collect())
    }
}

#[async_trait]
impl AttemptJournal for StateManager {
    async fn record(&self, record: &TransactionRecord) -> RelayerResult<()> {
        self.upsert_attempt(record).await
    }
}

/// Drain attempt snapshots into the journal until every sender is gone.
///
/// Failures are logged and the snapshot is skipped; submission never waits on
/// the database.
pub async fn run_journal(
    journal: Arc<dyn AttemptJournal>,
    mut snapshots: mpsc::UnboundedReceiver<TransactionRecord>,
) {
    info!("Attempt journal started");
    while let Some(record) = snapshots.recv().await {
        if let Err(e) = journal.record(&record).await {
            warn!(record_id = %record.id, "Failed to journal attempt: {}", e);
        }
    }
    info!("Attempt journal stopped");
}
