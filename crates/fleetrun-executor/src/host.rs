//! Retry loop for a single host within a batch.

use std::sync::Arc;

use fleetrun_core::{
    BatchId, BatchStore, CancelFlag, ExecError, ExecOutput, ExecutionPolicy, HostResultPatch,
    HostStatus, HostTarget, epoch_ms,
};
use fleetrun_session::ConnectionPool;

/// Terminal outcome of one host within one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// Drives one `HostResult` through the retry state machine:
/// pending -> running -> {completed | failed | cancelled}.
///
/// Exec failures never propagate out of `run`; after retries exhaust they
/// surface only as a terminal failed row.
pub struct HostExecutor<S> {
    store: Arc<S>,
    pool: Arc<ConnectionPool>,
}

impl<S> Clone for HostExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            pool: Arc::clone(&self.pool),
        }
    }
}

impl<S: BatchStore> HostExecutor<S> {
    #[must_use]
    pub fn new(store: Arc<S>, pool: Arc<ConnectionPool>) -> Self {
        Self { store, pool }
    }

    /// Run the batch command on one host, retrying per policy.
    ///
    /// The cancel flag is checked before the first acquisition, after every
    /// acquisition, and before each retry; when set, the row is persisted as
    /// cancelled and the loop exits without touching the remote host again.
    /// A host that spent its wait in `acquire` therefore never runs the
    /// command once the batch is cancelled.
    pub async fn run(
        &self,
        batch_id: BatchId,
        target: &HostTarget,
        command: &str,
        policy: &ExecutionPolicy,
        cancel: &CancelFlag,
    ) -> HostOutcome {
        if cancel.is_set() {
            return self.finish_cancelled(batch_id, target).await;
        }

        self.patch(
            batch_id,
            &target.host_id,
            HostResultPatch {
                status: Some(HostStatus::Running),
                started_at: Some(epoch_ms()),
                ..HostResultPatch::default()
            },
        )
        .await;

        let mut attempt: u32 = 1;
        loop {
            match self.attempt(target, command, policy, cancel).await {
                Ok(None) => return self.finish_cancelled(batch_id, target).await,
                Ok(Some(output)) => {
                    self.patch(
                        batch_id,
                        &target.host_id,
                        HostResultPatch {
                            status: Some(HostStatus::Completed),
                            exit_code: Some(output.exit_code),
                            stdout: Some(output.stdout),
                            stderr: Some(output.stderr),
                            duration_ms: Some(output.duration_ms),
                            retry_attempt: Some(attempt),
                            finished_at: Some(epoch_ms()),
                            ..HostResultPatch::default()
                        },
                    )
                    .await;
                    tracing::info!(%batch_id, host = %target.host_id, attempt, "host completed");
                    return HostOutcome::Completed;
                }
                Err(err) => {
                    let exhausted = attempt >= policy.max_attempts();
                    if exhausted || !err.is_retryable() {
                        let mut patch = HostResultPatch {
                            status: Some(HostStatus::Failed),
                            retry_attempt: Some(attempt),
                            finished_at: Some(epoch_ms()),
                            error: Some(err.to_string()),
                            ..HostResultPatch::default()
                        };
                        if let ExecError::Command { output, .. } = &err {
                            patch.exit_code = Some(output.exit_code);
                            patch.stdout = Some(output.stdout.clone());
                            patch.stderr = Some(output.stderr.clone());
                            patch.duration_ms = Some(output.duration_ms);
                        }
                        self.patch(batch_id, &target.host_id, patch).await;
                        tracing::warn!(
                            %batch_id,
                            host = %target.host_id,
                            attempt,
                            error = %err,
                            "host failed"
                        );
                        return HostOutcome::Failed;
                    }

                    self.patch(
                        batch_id,
                        &target.host_id,
                        HostResultPatch {
                            retry_attempt: Some(attempt),
                            error: Some(err.to_string()),
                            ..HostResultPatch::default()
                        },
                    )
                    .await;
                    tracing::debug!(
                        %batch_id,
                        host = %target.host_id,
                        attempt,
                        error = %err,
                        "retrying after back-off"
                    );
                    tokio::time::sleep(policy.retry_delay()).await;
                    if cancel.is_set() {
                        return self.finish_cancelled(batch_id, target).await;
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// One acquire-exec-return cycle. Broken sessions are discarded so the
    /// next attempt opens a fresh connection.
    ///
    /// Returns `Ok(None)` when the batch was cancelled while this host waited
    /// for a session; the session goes straight back unused.
    async fn attempt(
        &self,
        target: &HostTarget,
        command: &str,
        policy: &ExecutionPolicy,
        cancel: &CancelFlag,
    ) -> Result<Option<ExecOutput>, ExecError> {
        let mut pooled = self.pool.acquire(target).await?;
        if cancel.is_set() {
            self.pool.release(pooled).await;
            return Ok(None);
        }
        let result = pooled.exec(command, policy.timeout()).await;
        if pooled.is_broken() {
            self.pool.discard(pooled).await;
        } else {
            self.pool.release(pooled).await;
        }
        result.map(Some)
    }

    async fn finish_cancelled(&self, batch_id: BatchId, target: &HostTarget) -> HostOutcome {
        self.patch(
            batch_id,
            &target.host_id,
            HostResultPatch {
                status: Some(HostStatus::Cancelled),
                finished_at: Some(epoch_ms()),
                ..HostResultPatch::default()
            },
        )
        .await;
        tracing::debug!(%batch_id, host = %target.host_id, "host cancelled");
        HostOutcome::Cancelled
    }

    /// Persistence failures are logged, never surfaced: the batch must keep
    /// making progress even if the record store hiccups.
    async fn patch(&self, batch_id: BatchId, host_id: &str, patch: HostResultPatch) {
        if let Err(err) = self
            .store
            .update_host_result(batch_id, host_id, patch)
            .await
        {
            tracing::error!(%batch_id, host = %host_id, error = %err, "failed to persist host result");
        }
    }
}
