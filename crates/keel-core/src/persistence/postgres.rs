// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence implementation.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use sqlx::types::Json;

use crate::error::CoreError;

use super::{
    CheckpointRecord, CheckpointRow, ClaimUpdate, HeartbeatUpdate, ListOperationsFilter,
    NewOperationRow, OperationRecord, Persistence, StatusUpdate, map_checkpoint_error,
    map_insert_error,
};

const OPERATION_COLUMNS: &str = r#"
    operation_id, operation_type, status, worker_id, is_backend_local,
    created_at, started_at, completed_at, progress_percent, progress_message,
    metadata, result, error_message, last_heartbeat_at,
    reconciliation_status, reconciliation_started_at
"#;

const CHECKPOINT_COLUMNS: &str = r#"
    operation_id, checkpoint_type, created_at, state, artifacts_path,
    state_size_bytes, artifacts_size_bytes
"#;

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn insert_operation(&self, row: &NewOperationRow) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO operations
                (operation_id, operation_type, status, is_backend_local, created_at,
                 progress_percent, metadata)
            VALUES ($1, $2, 'pending', $3, $4, 0, $5)
            "#,
        )
        .bind(&row.operation_id)
        .bind(&row.operation_type)
        .bind(row.is_backend_local)
        .bind(row.created_at)
        .bind(Json(&row.metadata))
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, &row.operation_id))?;

        Ok(())
    }

    async fn get_operation(
        &self,
        operation_id: &str,
    ) -> Result<Option<OperationRecord>, CoreError> {
        let sql = format!(
            "SELECT {} FROM operations WHERE operation_id = $1",
            OPERATION_COLUMNS
        );
        let record = sqlx::query_as::<_, OperationRecord>(&sql)
            .bind(operation_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn list_operations(
        &self,
        filter: &ListOperationsFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<OperationRecord>, CoreError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM operations
            WHERE ($1::TEXT IS NULL OR operation_type = $1)
              AND ($2::TEXT IS NULL OR status = $2)
              AND (NOT $3::BOOLEAN OR status IN ('pending', 'running', 'pending_reconciliation'))
              AND ($4::TEXT IS NULL OR worker_id = $4)
            ORDER BY created_at DESC, operation_id DESC
            LIMIT $5 OFFSET $6
            "#,
            OPERATION_COLUMNS
        );
        let records = sqlx::query_as::<_, OperationRecord>(&sql)
            .bind(&filter.operation_type)
            .bind(&filter.status)
            .bind(filter.active_only)
            .bind(&filter.worker_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn count_operations(&self, filter: &ListOperationsFilter) -> Result<i64, CoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM operations
            WHERE ($1::TEXT IS NULL OR operation_type = $1)
              AND ($2::TEXT IS NULL OR status = $2)
              AND (NOT $3::BOOLEAN OR status IN ('pending', 'running', 'pending_reconciliation'))
              AND ($4::TEXT IS NULL OR worker_id = $4)
            "#,
        )
        .bind(&filter.operation_type)
        .bind(&filter.status)
        .bind(filter.active_only)
        .bind(&filter.worker_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn update_status(&self, update: &StatusUpdate<'_>) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE operations
            SET status = $3::TEXT,
                worker_id = CASE WHEN $3::TEXT = 'running' THEN COALESCE($5::TEXT, worker_id) ELSE worker_id END,
                started_at = CASE WHEN $3::TEXT = 'running' THEN COALESCE(started_at, $4::TIMESTAMPTZ) ELSE started_at END,
                last_heartbeat_at = CASE WHEN $3::TEXT = 'running' THEN $4::TIMESTAMPTZ ELSE last_heartbeat_at END,
                completed_at = CASE WHEN $3::TEXT IN ('completed', 'failed', 'cancelled') THEN COALESCE($10::TIMESTAMPTZ, $4::TIMESTAMPTZ) ELSE completed_at END,
                result = COALESCE($6::JSONB, result),
                error_message = COALESCE($7::TEXT, error_message),
                reconciliation_status = COALESCE($8::TEXT, reconciliation_status),
                reconciliation_started_at = CASE
                    WHEN $3::TEXT = 'pending_reconciliation' THEN $4::TIMESTAMPTZ
                    WHEN $3::TEXT = 'running' THEN NULL
                    ELSE reconciliation_started_at
                END
            WHERE operation_id = $1 AND status = $2
              AND ($9::TEXT IS NULL OR worker_id = $9)
            "#,
        )
        .bind(update.operation_id)
        .bind(update.expected_status)
        .bind(update.new_status)
        .bind(update.now)
        .bind(update.worker_id)
        .bind(update.result.map(Json))
        .bind(update.error_message)
        .bind(update.reconciliation_status)
        .bind(update.expected_worker)
        .bind(update.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_heartbeat(&self, update: &HeartbeatUpdate<'_>) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE operations
            SET last_heartbeat_at = $3,
                progress_percent = COALESCE($4::DOUBLE PRECISION, progress_percent),
                progress_message = COALESCE($5::TEXT, progress_message)
            WHERE operation_id = $1
              AND status = 'running'
              AND worker_id IS NOT DISTINCT FROM $2::TEXT
            "#,
        )
        .bind(update.operation_id)
        .bind(update.worker_id)
        .bind(update.now)
        .bind(update.progress_percent)
        .bind(update.progress_message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn claim_operation(&self, claim: &ClaimUpdate<'_>) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE operations
            SET status = 'running',
                worker_id = $2,
                last_heartbeat_at = $4,
                started_at = COALESCE(started_at, $4),
                reconciliation_status = CASE
                    WHEN status = 'pending_reconciliation' THEN 'reconciled'
                    ELSE reconciliation_status
                END,
                reconciliation_started_at = NULL
            WHERE operation_id = $1
              AND status IN ('running', 'pending_reconciliation')
              AND worker_id IS NOT DISTINCT FROM $3::TEXT
            "#,
        )
        .bind(claim.operation_id)
        .bind(claim.worker_id)
        .bind(claim.expected_owner)
        .bind(claim.now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn replace_metadata(
        &self,
        operation_id: &str,
        expected: &Value,
        metadata: &Value,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE operations SET metadata = $3 WHERE operation_id = $1 AND metadata = $2",
        )
        .bind(operation_id)
        .bind(Json(expected))
        .bind(Json(metadata))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn demote_stale_operations(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, CoreError> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE operations
            SET status = 'pending_reconciliation',
                reconciliation_status = 'unreconciled',
                reconciliation_started_at = $2
            WHERE status = 'running'
              AND COALESCE(last_heartbeat_at, started_at, created_at) < $1
            RETURNING operation_id
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn fail_orphaned_operations(
        &self,
        cutoff: DateTime<Utc>,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, CoreError> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE operations
            SET status = 'failed',
                error_message = $2,
                completed_at = $3,
                reconciliation_status = 'orphaned'
            WHERE status = 'pending_reconciliation'
              AND COALESCE(reconciliation_started_at, last_heartbeat_at, created_at) < $1
            RETURNING operation_id
            "#,
        )
        .bind(cutoff)
        .bind(error_message)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn upsert_checkpoint(&self, row: &CheckpointRow<'_>) -> Result<Option<String>, CoreError> {
        let mut tx = self.pool.begin().await?;

        // Row lock so concurrent saves for the same operation serialize.
        let previous: Option<Option<String>> = sqlx::query_scalar(
            "SELECT artifacts_path FROM operation_checkpoints WHERE operation_id = $1 FOR UPDATE",
        )
        .bind(row.operation_id)
        .fetch_optional(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO operation_checkpoints
                (operation_id, checkpoint_type, created_at, state, artifacts_path,
                 state_size_bytes, artifacts_size_bytes)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (operation_id) DO UPDATE SET
                checkpoint_type = EXCLUDED.checkpoint_type,
                created_at = EXCLUDED.created_at,
                state = EXCLUDED.state,
                artifacts_path = EXCLUDED.artifacts_path,
                state_size_bytes = EXCLUDED.state_size_bytes,
                artifacts_size_bytes = EXCLUDED.artifacts_size_bytes
            "#,
        )
        .bind(row.operation_id)
        .bind(row.checkpoint_type)
        .bind(row.created_at)
        .bind(Json(row.state))
        .bind(row.artifacts_path)
        .bind(row.state_size_bytes)
        .bind(row.artifacts_size_bytes)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_checkpoint_error(e, row.operation_id))?;

        tx.commit().await?;

        Ok(previous
            .flatten()
            .filter(|p| Some(p.as_str()) != row.artifacts_path))
    }

    async fn get_checkpoint(
        &self,
        operation_id: &str,
    ) -> Result<Option<CheckpointRecord>, CoreError> {
        let sql = format!(
            "SELECT {} FROM operation_checkpoints WHERE operation_id = $1",
            CHECKPOINT_COLUMNS
        );
        let record = sqlx::query_as::<_, CheckpointRecord>(&sql)
            .bind(operation_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn delete_checkpoint(
        &self,
        operation_id: &str,
    ) -> Result<Option<CheckpointRecord>, CoreError> {
        let sql = format!(
            "DELETE FROM operation_checkpoints WHERE operation_id = $1 RETURNING {}",
            CHECKPOINT_COLUMNS
        );
        let record = sqlx::query_as::<_, CheckpointRecord>(&sql)
            .bind(operation_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn delete_checkpoints_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CheckpointRecord>, CoreError> {
        let sql = format!(
            r#"
            DELETE FROM operation_checkpoints
            WHERE operation_id IN (
                SELECT operation_id FROM operation_checkpoints
                WHERE created_at < $1
                ORDER BY created_at
                LIMIT $2
            )
            RETURNING {}
            "#,
            CHECKPOINT_COLUMNS
        );
        let records = sqlx::query_as::<_, CheckpointRecord>(&sql)
            .bind(cutoff)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let result: Result<(i32,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}
