//! In-memory batch store.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

use fleetrun_core::{
    BatchExecution, BatchId, BatchPatch, BatchStatus, BatchStore, HostResult, HostResultPatch,
    HostStatus, NewBatch, StoreError, epoch_ms,
};

/// In-memory storage implementation.
///
/// Useful for tests and single-process deployments. Data is lost on restart.
/// Enforces the terminal-record rule: patches against a terminal batch or
/// host row are ignored.
#[derive(Default)]
pub struct MemoryStore {
    batches: RwLock<HashMap<BatchId, BatchExecution>>,
    results: RwLock<HashMap<BatchId, Vec<HostResult>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchStore for MemoryStore {
    async fn create_batch(&self, new: NewBatch) -> Result<BatchId, StoreError> {
        let id = Uuid::new_v4();
        let total_hosts = u32::try_from(new.target_host_ids.len())
            .map_err(|_| StoreError::Internal("too many targets".to_string()))?;

        let batch = BatchExecution {
            id,
            command: new.command,
            policy: new.policy,
            target_host_ids: new.target_host_ids,
            status: BatchStatus::Pending,
            total_hosts,
            completed_hosts: 0,
            failed_hosts: 0,
            started_at: None,
            finished_at: None,
            created_at: epoch_ms(),
        };

        self.batches
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .insert(id, batch);
        self.results
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .insert(id, Vec::new());

        Ok(id)
    }

    async fn get_batch(&self, id: BatchId) -> Result<Option<BatchExecution>, StoreError> {
        Ok(self
            .batches
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .get(&id)
            .cloned())
    }

    async fn update_batch(&self, id: BatchId, patch: BatchPatch) -> Result<(), StoreError> {
        let mut batches = self
            .batches
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let batch = batches.get_mut(&id).ok_or(StoreError::BatchNotFound(id))?;

        if batch.status.is_terminal() {
            tracing::debug!(batch_id = %id, "ignoring patch to terminal batch");
            return Ok(());
        }

        if let Some(v) = patch.status {
            batch.status = v;
        }
        if let Some(v) = patch.completed_hosts {
            batch.completed_hosts = v;
        }
        if let Some(v) = patch.failed_hosts {
            batch.failed_hosts = v;
        }
        if let Some(v) = patch.started_at {
            batch.started_at = Some(v);
        }
        if let Some(v) = patch.finished_at {
            batch.finished_at = Some(v);
        }
        Ok(())
    }

    async fn create_host_results(
        &self,
        batch_id: BatchId,
        host_ids: &[String],
    ) -> Result<(), StoreError> {
        if !self
            .batches
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .contains_key(&batch_id)
        {
            return Err(StoreError::BatchNotFound(batch_id));
        }

        let rows: Vec<HostResult> = host_ids
            .iter()
            .map(|host_id| HostResult {
                batch_id,
                host_id: host_id.clone(),
                status: HostStatus::Pending,
                exit_code: None,
                stdout: None,
                stderr: None,
                retry_attempt: 0,
                started_at: None,
                finished_at: None,
                duration_ms: None,
                error: None,
            })
            .collect();

        self.results
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .insert(batch_id, rows);
        Ok(())
    }

    async fn update_host_result(
        &self,
        batch_id: BatchId,
        host_id: &str,
        patch: HostResultPatch,
    ) -> Result<(), StoreError> {
        let mut results = self
            .results
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let rows = results
            .get_mut(&batch_id)
            .ok_or(StoreError::BatchNotFound(batch_id))?;
        let row = rows
            .iter_mut()
            .find(|r| r.host_id == host_id)
            .ok_or_else(|| StoreError::HostNotFound {
                batch: batch_id,
                host: host_id.to_string(),
            })?;

        if row.status.is_terminal() {
            tracing::debug!(batch_id = %batch_id, host_id, "ignoring patch to terminal host row");
            return Ok(());
        }

        if let Some(v) = patch.status {
            row.status = v;
        }
        if let Some(v) = patch.exit_code {
            row.exit_code = Some(v);
        }
        if let Some(v) = patch.stdout {
            row.stdout = Some(v);
        }
        if let Some(v) = patch.stderr {
            row.stderr = Some(v);
        }
        if let Some(v) = patch.retry_attempt {
            row.retry_attempt = v;
        }
        if let Some(v) = patch.started_at {
            row.started_at = Some(v);
        }
        if let Some(v) = patch.finished_at {
            row.finished_at = Some(v);
        }
        if let Some(v) = patch.duration_ms {
            row.duration_ms = Some(v);
        }
        if let Some(v) = patch.error {
            row.error = Some(v);
        }
        Ok(())
    }

    async fn list_host_results(&self, batch_id: BatchId) -> Result<Vec<HostResult>, StoreError> {
        self.results
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .get(&batch_id)
            .cloned()
            .ok_or(StoreError::BatchNotFound(batch_id))
    }
}
