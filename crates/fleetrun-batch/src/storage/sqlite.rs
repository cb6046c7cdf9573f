//! SQLite batch store (feature-gated).
//!
//! Policies and targets are stored as discrete columns and rows, never as
//! serialized blobs, so the schema stays queryable from outside the core.

use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use uuid::Uuid;

use fleetrun_core::{
    BatchExecution, BatchId, BatchPatch, BatchStatus, BatchStore, ExecutionPolicy, HostResult,
    HostResultPatch, HostStatus, NewBatch, StoreError, Topology, epoch_ms,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS batches (
        id TEXT PRIMARY KEY,
        command TEXT NOT NULL,
        topology TEXT NOT NULL,
        timeout_secs INTEGER NOT NULL,
        retry_count INTEGER NOT NULL,
        retry_delay_secs INTEGER NOT NULL,
        stop_on_first_error INTEGER NOT NULL,
        status TEXT NOT NULL,
        total_hosts INTEGER NOT NULL,
        completed_hosts INTEGER NOT NULL DEFAULT 0,
        failed_hosts INTEGER NOT NULL DEFAULT 0,
        started_at INTEGER,
        finished_at INTEGER,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS batch_targets (
        batch_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        host_id TEXT NOT NULL,
        PRIMARY KEY (batch_id, seq)
    )",
    "CREATE TABLE IF NOT EXISTS host_results (
        batch_id TEXT NOT NULL,
        host_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        status TEXT NOT NULL,
        exit_code INTEGER,
        stdout TEXT,
        stderr TEXT,
        retry_attempt INTEGER NOT NULL DEFAULT 0,
        started_at INTEGER,
        finished_at INTEGER,
        duration_ms INTEGER,
        error TEXT,
        PRIMARY KEY (batch_id, host_id)
    )",
];

/// SQLite storage implementation.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open the database and apply the schema.
    ///
    /// # Errors
    /// Returns `Internal` if the connection or schema setup fails.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        // One connection: keeps in-memory databases coherent and serializes
        // writers the way SQLite wants anyway.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await
            .map_err(internal)?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await.map_err(internal)?;
        }
        Ok(Self { pool })
    }
}

fn internal(err: sqlx::Error) -> StoreError {
    StoreError::Internal(err.to_string())
}

fn batch_from_row(row: &SqliteRow) -> Result<BatchExecution, StoreError> {
    let id_text: String = row.get("id");
    let id = Uuid::parse_str(&id_text)
        .map_err(|e| StoreError::Internal(format!("bad batch id {id_text}: {e}")))?;
    let topology_text: String = row.get("topology");
    let topology = Topology::parse(&topology_text)
        .ok_or_else(|| StoreError::Internal(format!("bad topology: {topology_text}")))?;
    let status_text: String = row.get("status");
    let status = BatchStatus::parse(&status_text)
        .ok_or_else(|| StoreError::Internal(format!("bad batch status: {status_text}")))?;

    Ok(BatchExecution {
        id,
        command: row.get("command"),
        policy: ExecutionPolicy {
            topology,
            timeout_secs: row.get::<i64, _>("timeout_secs").unsigned_abs(),
            retry_count: u32::try_from(row.get::<i64, _>("retry_count")).unwrap_or(0),
            retry_delay_secs: row.get::<i64, _>("retry_delay_secs").unsigned_abs(),
            stop_on_first_error: row.get("stop_on_first_error"),
        },
        target_host_ids: Vec::new(), // filled in by the caller
        status,
        total_hosts: u32::try_from(row.get::<i64, _>("total_hosts")).unwrap_or(0),
        completed_hosts: u32::try_from(row.get::<i64, _>("completed_hosts")).unwrap_or(0),
        failed_hosts: u32::try_from(row.get::<i64, _>("failed_hosts")).unwrap_or(0),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        created_at: row.get("created_at"),
    })
}

fn host_result_from_row(batch_id: BatchId, row: &SqliteRow) -> Result<HostResult, StoreError> {
    let status_text: String = row.get("status");
    let status = HostStatus::parse(&status_text)
        .ok_or_else(|| StoreError::Internal(format!("bad host status: {status_text}")))?;

    Ok(HostResult {
        batch_id,
        host_id: row.get("host_id"),
        status,
        exit_code: row.get("exit_code"),
        stdout: row.get("stdout"),
        stderr: row.get("stderr"),
        retry_attempt: u32::try_from(row.get::<i64, _>("retry_attempt")).unwrap_or(0),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        duration_ms: row
            .get::<Option<i64>, _>("duration_ms")
            .map(i64::unsigned_abs),
        error: row.get("error"),
    })
}

#[async_trait]
impl BatchStore for SqliteStore {
    async fn create_batch(&self, new: NewBatch) -> Result<BatchId, StoreError> {
        let id = Uuid::new_v4();
        let total_hosts = i64::try_from(new.target_host_ids.len())
            .map_err(|_| StoreError::Internal("too many targets".to_string()))?;

        let mut tx = self.pool.begin().await.map_err(internal)?;
        sqlx::query(
            "INSERT INTO batches (
                id, command, topology, timeout_secs, retry_count,
                retry_delay_secs, stop_on_first_error, status, total_hosts,
                created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(id.to_string())
        .bind(&new.command)
        .bind(new.policy.topology.as_str())
        .bind(i64::try_from(new.policy.timeout_secs).unwrap_or(i64::MAX))
        .bind(i64::from(new.policy.retry_count))
        .bind(i64::try_from(new.policy.retry_delay_secs).unwrap_or(i64::MAX))
        .bind(new.policy.stop_on_first_error)
        .bind(BatchStatus::Pending.as_str())
        .bind(total_hosts)
        .bind(epoch_ms())
        .execute(&mut *tx)
        .await
        .map_err(internal)?;

        for (seq, host_id) in new.target_host_ids.iter().enumerate() {
            sqlx::query("INSERT INTO batch_targets (batch_id, seq, host_id) VALUES (?1, ?2, ?3)")
                .bind(id.to_string())
                .bind(i64::try_from(seq).unwrap_or(i64::MAX))
                .bind(host_id)
                .execute(&mut *tx)
                .await
                .map_err(internal)?;
        }

        tx.commit().await.map_err(internal)?;
        Ok(id)
    }

    async fn get_batch(&self, id: BatchId) -> Result<Option<BatchExecution>, StoreError> {
        let Some(row) = sqlx::query("SELECT * FROM batches WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?
        else {
            return Ok(None);
        };

        let mut batch = batch_from_row(&row)?;
        let targets =
            sqlx::query("SELECT host_id FROM batch_targets WHERE batch_id = ?1 ORDER BY seq")
                .bind(id.to_string())
                .fetch_all(&self.pool)
                .await
                .map_err(internal)?;
        batch.target_host_ids = targets.iter().map(|r| r.get("host_id")).collect();
        Ok(Some(batch))
    }

    async fn update_batch(&self, id: BatchId, patch: BatchPatch) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE batches SET
                status = COALESCE(?1, status),
                completed_hosts = COALESCE(?2, completed_hosts),
                failed_hosts = COALESCE(?3, failed_hosts),
                started_at = COALESCE(?4, started_at),
                finished_at = COALESCE(?5, finished_at)
            WHERE id = ?6 AND status IN ('pending', 'running')",
        )
        .bind(patch.status.map(BatchStatus::as_str))
        .bind(patch.completed_hosts.map(i64::from))
        .bind(patch.failed_hosts.map(i64::from))
        .bind(patch.started_at)
        .bind(patch.finished_at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(internal)?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM batches WHERE id = ?1")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(internal)?;
            if exists.is_none() {
                return Err(StoreError::BatchNotFound(id));
            }
            // terminal record: patch ignored
        }
        Ok(())
    }

    async fn create_host_results(
        &self,
        batch_id: BatchId,
        host_ids: &[String],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(internal)?;
        for (seq, host_id) in host_ids.iter().enumerate() {
            sqlx::query(
                "INSERT INTO host_results (batch_id, host_id, seq, status)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(batch_id.to_string())
            .bind(host_id)
            .bind(i64::try_from(seq).unwrap_or(i64::MAX))
            .bind(HostStatus::Pending.as_str())
            .execute(&mut *tx)
            .await
            .map_err(internal)?;
        }
        tx.commit().await.map_err(internal)
    }

    async fn update_host_result(
        &self,
        batch_id: BatchId,
        host_id: &str,
        patch: HostResultPatch,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE host_results SET
                status = COALESCE(?1, status),
                exit_code = COALESCE(?2, exit_code),
                stdout = COALESCE(?3, stdout),
                stderr = COALESCE(?4, stderr),
                retry_attempt = COALESCE(?5, retry_attempt),
                started_at = COALESCE(?6, started_at),
                finished_at = COALESCE(?7, finished_at),
                duration_ms = COALESCE(?8, duration_ms),
                error = COALESCE(?9, error)
            WHERE batch_id = ?10 AND host_id = ?11
              AND status IN ('pending', 'running')",
        )
        .bind(patch.status.map(HostStatus::as_str))
        .bind(patch.exit_code)
        .bind(patch.stdout)
        .bind(patch.stderr)
        .bind(patch.retry_attempt.map(i64::from))
        .bind(patch.started_at)
        .bind(patch.finished_at)
        .bind(patch.duration_ms.map(|v| i64::try_from(v).unwrap_or(i64::MAX)))
        .bind(patch.error)
        .bind(batch_id.to_string())
        .bind(host_id)
        .execute(&self.pool)
        .await
        .map_err(internal)?;

        if result.rows_affected() == 0 {
            let exists =
                sqlx::query("SELECT 1 FROM host_results WHERE batch_id = ?1 AND host_id = ?2")
                    .bind(batch_id.to_string())
                    .bind(host_id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(internal)?;
            if exists.is_none() {
                return Err(StoreError::HostNotFound {
                    batch: batch_id,
                    host: host_id.to_string(),
                });
            }
            // terminal row: patch ignored
        }
        Ok(())
    }

    async fn list_host_results(&self, batch_id: BatchId) -> Result<Vec<HostResult>, StoreError> {
        let rows = sqlx::query("SELECT * FROM host_results WHERE batch_id = ?1 ORDER BY seq")
            .bind(batch_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;

        if rows.is_empty() {
            let exists = sqlx::query("SELECT 1 FROM batches WHERE id = ?1")
                .bind(batch_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(internal)?;
            if exists.is_none() {
                return Err(StoreError::BatchNotFound(batch_id));
            }
        }

        rows.iter()
            .map(|row| host_result_from_row(batch_id, row))
            .collect()
    }
}
