// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.
//!
//! Every write is a single guarded statement, so no write needs an explicit
//! transaction to stay atomic per instance.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::CoreError;
use crate::migrations;
use crate::model::{ActivityResult, HistoryEvent, InstanceRecord, InstanceStatus};

use super::{DurableStore, check_append, check_transition};

/// SQLite-backed [`DurableStore`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a store from an existing, already migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a store from a file path.
    ///
    /// Creates parent directories and the database file if needed, connects
    /// and runs all migrations.
    ///
    /// ```ignore
    /// let store = SqliteStore::from_path(".data/drover.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        migrations::run_sqlite(&pool).await?;
        Ok(Self { pool })
    }

    /// A private in-memory database, migrated and ready to use.
    pub async fn in_memory() -> Result<Self, CoreError> {
        // One connection that never expires, otherwise the database vanishes.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        migrations::run_sqlite(&pool).await?;
        Ok(Self { pool })
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn current_status(&self, instance_id: &str) -> Result<InstanceStatus, CoreError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM instances WHERE instance_id = ?")
                .bind(instance_id)
                .fetch_optional(&self.pool)
                .await?;
        status
            .ok_or_else(|| CoreError::not_found(instance_id))?
            .parse()
    }

    async fn history_len(&self, instance_id: &str) -> Result<usize, CoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM history_events WHERE instance_id = ?")
                .bind(instance_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as usize)
    }
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    instance_id: String,
    orchestrator_name: String,
    input: String,
    status: String,
    output: Option<String>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<InstanceRow> for InstanceRecord {
    type Error = CoreError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        Ok(InstanceRecord {
            instance_id: row.instance_id,
            orchestrator_name: row.orchestrator_name,
            input: serde_json::from_str(&row.input)?,
            status: row.status.parse()?,
            output: row.output.as_deref().map(serde_json::from_str).transpose()?,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            finished_at: row.finished_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    sequence_index: i64,
    activity_name: String,
    input_snapshot: String,
    result_kind: Option<String>,
    result: Option<String>,
    scheduled_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<HistoryRow> for HistoryEvent {
    type Error = CoreError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        let result = match (row.result_kind.as_deref(), row.result) {
            (None, _) => None,
            (Some("completed"), Some(raw)) => {
                Some(ActivityResult::Completed(serde_json::from_str(&raw)?))
            }
            (Some("failed"), Some(detail)) => Some(ActivityResult::Failed(detail)),
            (Some(kind), _) => {
                return Err(CoreError::DatabaseError {
                    operation: "decode_history".to_string(),
                    details: format!(
                        "event {} has result kind '{}' without a readable result",
                        row.sequence_index, kind
                    ),
                });
            }
        };

        Ok(HistoryEvent {
            sequence_index: row.sequence_index as u32,
            activity_name: row.activity_name,
            input_snapshot: serde_json::from_str(&row.input_snapshot)?,
            result,
            scheduled_at: row.scheduled_at,
            completed_at: row.completed_at,
        })
    }
}

fn encode_result(result: &ActivityResult) -> Result<String, CoreError> {
    Ok(match result {
        ActivityResult::Completed(value) => serde_json::to_string(value)?,
        ActivityResult::Failed(detail) => detail.clone(),
    })
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn create_instance(
        &self,
        instance_id: &str,
        orchestrator_name: &str,
        input: &Value,
    ) -> Result<(), CoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO instances (instance_id, orchestrator_name, input, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, 'pending', ?4, ?4)
            ON CONFLICT (instance_id) DO NOTHING
            "#,
        )
        .bind(instance_id)
        .bind(orchestrator_name)
        .bind(serde_json::to_string(input)?)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::InstanceAlreadyExists {
                instance_id: instance_id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>, CoreError> {
        let row = sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT instance_id, orchestrator_name, input, status, output, error,
                   created_at, updated_at, finished_at
            FROM instances
            WHERE instance_id = ?
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(InstanceRecord::try_from).transpose()
    }

    async fn load_history(&self, instance_id: &str) -> Result<Vec<HistoryEvent>, CoreError> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT sequence_index, activity_name, input_snapshot, result_kind, result,
                   scheduled_at, completed_at
            FROM history_events
            WHERE instance_id = ?
            ORDER BY sequence_index ASC
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            // Distinguish "no history yet" from "no such instance".
            self.current_status(instance_id).await?;
        }

        rows.into_iter().map(HistoryEvent::try_from).collect()
    }

    async fn append_event(&self, instance_id: &str, event: &HistoryEvent) -> Result<(), CoreError> {
        if event.result.is_some() {
            let status = self.current_status(instance_id).await?;
            return check_append(instance_id, status, event.sequence_index as usize, event);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO history_events
                (instance_id, sequence_index, activity_name, input_snapshot, scheduled_at)
            SELECT ?1, ?2, ?3, ?4, ?5
            WHERE EXISTS (
                    SELECT 1 FROM instances
                    WHERE instance_id = ?1 AND status IN ('pending', 'running')
                )
              AND (SELECT COUNT(*) FROM history_events WHERE instance_id = ?1) = ?2
            "#,
        )
        .bind(instance_id)
        .bind(event.sequence_index as i64)
        .bind(&event.activity_name)
        .bind(serde_json::to_string(&event.input_snapshot)?)
        .bind(event.scheduled_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let status = self.current_status(instance_id).await?;
        let len = self.history_len(instance_id).await?;
        check_append(instance_id, status, len, event)?;
        Err(CoreError::HistoryConflict {
            instance_id: instance_id.to_string(),
            sequence_index: event.sequence_index,
            reason: "concurrent append".to_string(),
        })
    }

    async fn complete_event(
        &self,
        instance_id: &str,
        sequence_index: u32,
        result: &ActivityResult,
    ) -> Result<(), CoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE history_events
            SET result_kind = ?1, result = ?2, completed_at = ?3
            WHERE instance_id = ?4 AND sequence_index = ?5 AND result_kind IS NULL
            "#,
        )
        .bind(result.kind())
        .bind(encode_result(result)?)
        .bind(Utc::now())
        .bind(instance_id)
        .bind(sequence_index as i64)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 1 {
            return Ok(());
        }

        let existing: Option<Option<String>> = sqlx::query_scalar(
            "SELECT result_kind FROM history_events WHERE instance_id = ? AND sequence_index = ?",
        )
        .bind(instance_id)
        .bind(sequence_index as i64)
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            None => Err(CoreError::EventNotFound {
                instance_id: instance_id.to_string(),
                sequence_index,
            }),
            Some(_) => Err(CoreError::ResultAlreadyRecorded {
                instance_id: instance_id.to_string(),
                sequence_index,
            }),
        }
    }

    async fn set_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> Result<(), CoreError> {
        let current = self.current_status(instance_id).await?;
        check_transition(instance_id, current, status, error)?;

        let now = Utc::now();
        let (output, error, finished_at) = match status {
            InstanceStatus::Completed => (
                Some(serde_json::to_string(output.unwrap_or(&Value::Null))?),
                None,
                Some(now),
            ),
            InstanceStatus::Failed => (None, error.map(str::to_string), Some(now)),
            InstanceStatus::Pending | InstanceStatus::Running => (None, None, None),
        };

        let updated = sqlx::query(
            r#"
            UPDATE instances
            SET status = ?1,
                output = COALESCE(?2, output),
                error = COALESCE(?3, error),
                finished_at = COALESCE(?4, finished_at),
                updated_at = ?5
            WHERE instance_id = ?6 AND status = ?7
            "#,
        )
        .bind(status.as_str())
        .bind(output)
        .bind(error)
        .bind(finished_at)
        .bind(now)
        .bind(instance_id)
        .bind(current.as_str())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            // Another writer moved the instance between the read and the update.
            let actual = self.current_status(instance_id).await?;
            return Err(CoreError::InvalidInstanceState {
                instance_id: instance_id.to_string(),
                expected: current.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<InstanceRecord>, CoreError> {
        let rows = sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT instance_id, orchestrator_name, input, status, output, error,
                   created_at, updated_at, finished_at
            FROM instances
            WHERE (?1 IS NULL OR status = ?1)
            ORDER BY created_at ASC, instance_id ASC
            LIMIT ?2 OFFSET ?3
            "#,
        )
        .bind(status.map(InstanceStatus::as_str))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(InstanceRecord::try_from).collect()
    }

    async fn health_check(&self) -> Result<bool, CoreError> {
        let result: Result<(i64,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}
