//! SQLite run store.
//!
//! Implements `RunStore` from `relayflow-core`. Workflow definitions are
//! stored as JSON documents; a run and its outbox row are always inserted in
//! one transaction, which is the ingestion contract the relay depends on.

use chrono::{DateTime, SecondsFormat, Utc};
use relayflow_core::repository::run_store::RunStore;
use relayflow_types::error::RepositoryError;
use relayflow_types::workflow::{OutboxEntry, RunWithDefinition, WorkflowDefinition, WorkflowRun};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `RunStore`.
pub struct SqliteRunStore {
    pool: DatabasePool,
}

impl SqliteRunStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Persist a validated workflow definition. Fails with `Conflict` if the
    /// definition is invalid or its id is already taken.
    pub async fn save_workflow(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        def.validate()
            .map_err(|e| RepositoryError::Conflict(e.to_string()))?;
        let definition = serde_json::to_string(def)
            .map_err(|e| RepositoryError::Query(format!("serialize workflow definition: {e}")))?;

        sqlx::query(
            "INSERT INTO workflows (id, name, definition, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(def.id.to_string())
        .bind(&def.name)
        .bind(definition)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e {
                if db_err.message().contains("UNIQUE") {
                    return RepositoryError::Conflict(format!("workflow {} already exists", def.id));
                }
            }
            map_sqlx(e)
        })?;

        tracing::debug!(workflow_id = %def.id, name = %def.name, "workflow saved");
        Ok(())
    }

    /// Load a workflow definition by id.
    pub async fn get_workflow(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;

        row.map(|r| {
            let definition: String = r.try_get("definition").map_err(map_sqlx)?;
            parse_definition(&definition)
        })
        .transpose()
    }

    /// Create a run and its outbox row in one transaction.
    ///
    /// Fails with `NotFound` if the workflow does not exist.
    pub async fn create_run_with_outbox(
        &self,
        workflow_id: &Uuid,
        trigger_payload: serde_json::Value,
    ) -> Result<WorkflowRun, RepositoryError> {
        let run = WorkflowRun {
            id: Uuid::now_v7(),
            workflow_id: *workflow_id,
            trigger_payload,
            created_at: Utc::now(),
        };
        let payload = serde_json::to_string(&run.trigger_payload)
            .map_err(|e| RepositoryError::Query(format!("serialize trigger payload: {e}")))?;
        let created_at = format_datetime(&run.created_at);

        let mut tx = self.pool.writer.begin().await.map_err(map_sqlx)?;

        let exists = sqlx::query("SELECT 1 FROM workflows WHERE id = ?")
            .bind(workflow_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        if exists.is_none() {
            return Err(RepositoryError::NotFound);
        }

        sqlx::query(
            "INSERT INTO workflow_runs (id, workflow_id, trigger_payload, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(run.id.to_string())
        .bind(workflow_id.to_string())
        .bind(payload)
        .bind(&created_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        sqlx::query("INSERT INTO workflow_run_outbox (id, run_id, created_at) VALUES (?, ?, ?)")
            .bind(Uuid::now_v7().to_string())
            .bind(run.id.to_string())
            .bind(&created_at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;

        tracing::info!(run_id = %run.id, workflow_id = %workflow_id, "workflow run enqueued");
        Ok(run)
    }
}

// ---------------------------------------------------------------------------
// RunStore
// ---------------------------------------------------------------------------

impl RunStore for SqliteRunStore {
    async fn fetch_pending_outbox(&self, limit: u32) -> Result<Vec<OutboxEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, run_id, created_at FROM workflow_run_outbox
             ORDER BY created_at ASC, id ASC
             LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(map_sqlx)?;
                let run_id: String = row.try_get("run_id").map_err(map_sqlx)?;
                let created_at: String = row.try_get("created_at").map_err(map_sqlx)?;
                Ok(OutboxEntry {
                    id: parse_uuid(&id)?,
                    run_id: parse_uuid(&run_id)?,
                    created_at: parse_datetime(&created_at)?,
                })
            })
            .collect()
    }

    async fn delete_pending(&self, ids: &[Uuid]) -> Result<u64, RepositoryError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("DELETE FROM workflow_run_outbox WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id.to_string());
        }

        let result = query.execute(&self.pool.writer).await.map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn load_run_with_definition(
        &self,
        run_id: &Uuid,
    ) -> Result<Option<RunWithDefinition>, RepositoryError> {
        let row = sqlx::query(
            "SELECT r.id, r.workflow_id, r.trigger_payload, r.created_at, w.definition
             FROM workflow_runs r
             JOIN workflows w ON w.id = r.workflow_id
             WHERE r.id = ?",
        )
        .bind(run_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: String = row.try_get("id").map_err(map_sqlx)?;
        let workflow_id: String = row.try_get("workflow_id").map_err(map_sqlx)?;
        let trigger_payload: String = row.try_get("trigger_payload").map_err(map_sqlx)?;
        let created_at: String = row.try_get("created_at").map_err(map_sqlx)?;
        let definition: String = row.try_get("definition").map_err(map_sqlx)?;

        let run = WorkflowRun {
            id: parse_uuid(&id)?,
            workflow_id: parse_uuid(&workflow_id)?,
            trigger_payload: serde_json::from_str(&trigger_payload)
                .map_err(|e| RepositoryError::Query(format!("invalid trigger_payload: {e}")))?,
            created_at: parse_datetime(&created_at)?,
        };

        Ok(Some(RunWithDefinition {
            run,
            definition: parse_definition(&definition)?,
        }))
    }

    async fn count_pending_outbox(&self) -> Result<u64, RepositoryError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM workflow_run_outbox")
            .fetch_one(&self.pool.reader)
            .await
            .map_err(map_sqlx)?;
        Ok(count as u64)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Connection-level failures become `Connection`; everything else is a query error.
fn map_sqlx(e: sqlx::Error) -> RepositoryError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            RepositoryError::Connection
        }
        other => RepositoryError::Query(other.to_string()),
    }
}

fn parse_definition(s: &str) -> Result<WorkflowDefinition, RepositoryError> {
    serde_json::from_str(s)
        .map_err(|e| RepositoryError::Query(format!("invalid workflow definition JSON: {e}")))
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    Uuid::parse_str(s).map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
