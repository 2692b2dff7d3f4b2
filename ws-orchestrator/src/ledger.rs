//! Persisted record of which transactions are done for which workspace.
//!
//! A row is written, not done, before the first apply attempt and flipped to
//! done once the apply completes. It is removed only when the matching
//! rollback completes, so a missing row means the resource was never touched
//! or has been rolled back.

use crate::error::Result;
use crate::transaction::TransactionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use tracing::instrument;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceTransaction {
    pub workspace_id: String,
    pub transaction_id: TransactionId,
    pub done: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// All ledger rows for a workspace, done or not
    pub async fn entries(&self, workspace_id: &str) -> Result<Vec<WorkspaceTransaction>> {
        let rows = sqlx::query_as::<_, LedgerRow>(
            "SELECT * FROM workspace_transactions WHERE workspace_id = ? ORDER BY created_at ASC",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|row| row.into()).collect())
    }

    /// Transactions currently marked done for a workspace
    pub async fn done_set(&self, workspace_id: &str) -> Result<BTreeSet<TransactionId>> {
        let ids: Vec<TransactionId> = sqlx::query_scalar(
            "SELECT transaction_id FROM workspace_transactions WHERE workspace_id = ? AND done = 1",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().collect())
    }

    /// Every transaction with a row for the workspace, done or only started
    pub async fn recorded_set(&self, workspace_id: &str) -> Result<BTreeSet<TransactionId>> {
        let ids: Vec<TransactionId> = sqlx::query_scalar(
            "SELECT transaction_id FROM workspace_transactions WHERE workspace_id = ?",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().collect())
    }

    /// Record that an apply is about to run. Leaves an existing row,
    /// done or not, untouched.
    #[instrument(skip(self))]
    pub async fn mark_started(
        &self,
        workspace_id: &str,
        transaction_id: TransactionId,
    ) -> Result<()> {
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO workspace_transactions (workspace_id, transaction_id, done, created_at, updated_at)
            VALUES (?, ?, 0, ?, ?)
            ON CONFLICT (workspace_id, transaction_id) DO NOTHING
            "#,
        )
        .bind(workspace_id)
        .bind(transaction_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn mark_done(&self, workspace_id: &str, transaction_id: TransactionId) -> Result<()> {
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO workspace_transactions (workspace_id, transaction_id, done, created_at, updated_at)
            VALUES (?, ?, 1, ?, ?)
            ON CONFLICT (workspace_id, transaction_id)
            DO UPDATE SET done = 1, updated_at = excluded.updated_at
            "#,
        )
        .bind(workspace_id)
        .bind(transaction_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Drop a ledger entry once its rollback has completed. Removing an absent
    /// entry is not an error.
    #[instrument(skip(self))]
    pub async fn remove(&self, workspace_id: &str, transaction_id: TransactionId) -> Result<()> {
        sqlx::query(
            "DELETE FROM workspace_transactions WHERE workspace_id = ? AND transaction_id = ?",
        )
        .bind(workspace_id)
        .bind(transaction_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct LedgerRow {
    workspace_id: String,
    transaction_id: TransactionId,
    done: bool,
    created_at: i64,
    updated_at: i64,
}

impl From<LedgerRow> for WorkspaceTransaction {
    fn from(row: LedgerRow) -> Self {
        Self {
            workspace_id: row.workspace_id,
            transaction_id: row.transaction_id,
            done: row.done,
            created_at: DateTime::from_timestamp(row.created_at, 0).unwrap_or_default(),
            updated_at: DateTime::from_timestamp(row.updated_at, 0).unwrap_or_default(),
        }
    }
}
