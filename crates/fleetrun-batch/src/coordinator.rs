//! Batch coordinator: resolve targets, fan out per topology, aggregate.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinSet;

use fleetrun_core::{
    BatchExecution, BatchId, BatchPatch, BatchStatus, BatchStore, CancelFlag, CoordinatorError,
    ExecutionPolicy, HostResult, HostResultPatch, HostStatus, HostTarget, NewBatch, StoreError,
    TargetResolver, TargetSelector, Topology, epoch_ms,
};
use fleetrun_executor::{HostExecutor, HostOutcome};
use fleetrun_session::ConnectionPool;

/// Orchestrates batches over injected store, resolver, and pool.
///
/// A submitted batch runs on a spawned driver task; `submit` returns the
/// batch id immediately and callers poll `get_status`. A batch always reaches
/// a terminal status or is explicitly cancelled; it never hangs silently.
pub struct BatchCoordinator<S, R> {
    store: Arc<S>,
    resolver: Arc<R>,
    pool: Arc<ConnectionPool>,
    /// Cancel flags for batches whose driver task is still alive.
    active: RwLock<HashMap<BatchId, CancelFlag>>,
}

impl<S, R> BatchCoordinator<S, R>
where
    S: BatchStore + 'static,
    R: TargetResolver + 'static,
{
    #[must_use]
    pub fn new(store: Arc<S>, resolver: Arc<R>, pool: Arc<ConnectionPool>) -> Arc<Self> {
        Arc::new(Self {
            store,
            resolver,
            pool,
            active: RwLock::new(HashMap::new()),
        })
    }

    /// Submit one command against a set of targets.
    ///
    /// Creates the batch record plus one pending host result per target,
    /// then launches the driver task.
    ///
    /// # Errors
    /// - `EmptyCommand` if the command is blank
    /// - `Unauthorized` (via `Resolve`) if the caller does not own a target
    /// - `NoTargets` if the selector resolves to nothing
    pub async fn submit(
        self: &Arc<Self>,
        command: &str,
        selector: &TargetSelector,
        caller_id: &str,
        policy: ExecutionPolicy,
    ) -> Result<BatchId, CoordinatorError> {
        if command.trim().is_empty() {
            return Err(CoordinatorError::EmptyCommand);
        }
        let targets = self.resolver.resolve(selector, caller_id).await?;
        if targets.is_empty() {
            return Err(CoordinatorError::NoTargets);
        }

        let host_ids: Vec<String> = targets.iter().map(|t| t.host_id.clone()).collect();
        let batch_id = self
            .store
            .create_batch(NewBatch {
                command: command.to_string(),
                policy,
                target_host_ids: host_ids.clone(),
            })
            .await?;
        self.store.create_host_results(batch_id, &host_ids).await?;

        let cancel = CancelFlag::new();
        self.active.write().await.insert(batch_id, cancel.clone());
        tracing::info!(
            %batch_id,
            hosts = targets.len(),
            topology = ?policy.topology,
            "batch submitted"
        );

        let coordinator = Arc::clone(self);
        let command = command.to_string();
        tokio::spawn(async move {
            coordinator
                .drive(batch_id, command, targets, policy, cancel)
                .await;
        });

        Ok(batch_id)
    }

    /// Cancel a pending or running batch.
    ///
    /// Sets the batch-scoped flag consumed by every host executor, marks all
    /// non-terminal host rows cancelled, and marks the batch cancelled.
    /// Returns `Ok(true)` only when this call made the batch terminal;
    /// `Ok(false)` when it already was, including when the driver finished
    /// it concurrently.
    ///
    /// # Errors
    /// `BatchNotFound` if the id is unknown.
    pub async fn cancel(&self, batch_id: BatchId) -> Result<bool, CoordinatorError> {
        let batch = self
            .store
            .get_batch(batch_id)
            .await?
            .ok_or(CoordinatorError::BatchNotFound(batch_id))?;
        if batch.status.is_terminal() {
            return Ok(false);
        }

        if let Some(flag) = self.active.read().await.get(&batch_id) {
            flag.set();
        }

        let now = epoch_ms();
        let (mut completed, mut failed) = (0u32, 0u32);
        for row in self.store.list_host_results(batch_id).await? {
            match row.status {
                HostStatus::Completed => completed += 1,
                HostStatus::Failed => failed += 1,
                HostStatus::Cancelled => {}
                HostStatus::Pending | HostStatus::Running => {
                    self.store
                        .update_host_result(
                            batch_id,
                            &row.host_id,
                            HostResultPatch {
                                status: Some(HostStatus::Cancelled),
                                finished_at: Some(now),
                                ..HostResultPatch::default()
                            },
                        )
                        .await?;
                }
            }
        }

        self.store
            .update_batch(
                batch_id,
                BatchPatch {
                    status: Some(BatchStatus::Cancelled),
                    completed_hosts: Some(completed),
                    failed_hosts: Some(failed),
                    finished_at: Some(now),
                    ..BatchPatch::default()
                },
            )
            .await?;

        // The driver may have finalized the batch between the read above and
        // this patch; the store keeps whichever terminal status landed first,
        // so the stored status decides who won.
        let cancelled = self
            .store
            .get_batch(batch_id)
            .await?
            .is_some_and(|b| b.status == BatchStatus::Cancelled);
        if cancelled {
            tracing::info!(%batch_id, "batch cancelled");
        }
        Ok(cancelled)
    }

    /// Fetch the batch record.
    ///
    /// # Errors
    /// `BatchNotFound` if the id is unknown.
    pub async fn get_status(&self, batch_id: BatchId) -> Result<BatchExecution, CoordinatorError> {
        self.store
            .get_batch(batch_id)
            .await?
            .ok_or(CoordinatorError::BatchNotFound(batch_id))
    }

    /// Fetch host result rows in submission order.
    ///
    /// # Errors
    /// `BatchNotFound` if the id is unknown.
    pub async fn get_results(&self, batch_id: BatchId) -> Result<Vec<HostResult>, CoordinatorError> {
        match self.store.list_host_results(batch_id).await {
            Ok(rows) => Ok(rows),
            Err(StoreError::BatchNotFound(id)) => Err(CoordinatorError::BatchNotFound(id)),
            Err(err) => Err(CoordinatorError::Store(err)),
        }
    }

    async fn drive(
        self: Arc<Self>,
        batch_id: BatchId,
        command: String,
        targets: Vec<HostTarget>,
        policy: ExecutionPolicy,
        cancel: CancelFlag,
    ) {
        self.patch_batch(
            batch_id,
            BatchPatch {
                status: Some(BatchStatus::Running),
                started_at: Some(epoch_ms()),
                ..BatchPatch::default()
            },
        )
        .await;

        let executor = HostExecutor::new(Arc::clone(&self.store), Arc::clone(&self.pool));
        let (completed, failed) = match policy.topology {
            Topology::Parallel => {
                self.run_parallel(&executor, batch_id, &command, targets, policy, &cancel)
                    .await
            }
            Topology::Sequential => {
                self.run_sequential(&executor, batch_id, &command, targets, policy, &cancel)
                    .await
            }
        };

        self.active.write().await.remove(&batch_id);

        // Cancel() may have written the terminal state already; a terminal
        // batch is never re-opened.
        match self.store.get_batch(batch_id).await {
            Ok(Some(batch)) if batch.status == BatchStatus::Running => {
                let status = if failed == 0 || completed > 0 {
                    BatchStatus::Completed
                } else {
                    BatchStatus::Failed
                };
                self.patch_batch(
                    batch_id,
                    BatchPatch {
                        status: Some(status),
                        completed_hosts: Some(completed),
                        failed_hosts: Some(failed),
                        finished_at: Some(epoch_ms()),
                        ..BatchPatch::default()
                    },
                )
                .await;
                tracing::info!(%batch_id, ?status, completed, failed, "batch finished");
            }
            Ok(_) => {
                tracing::debug!(%batch_id, "batch already terminal, skipping aggregation");
            }
            Err(err) => {
                tracing::error!(%batch_id, error = %err, "failed to load batch for aggregation");
            }
        }
    }

    /// All hosts at once; the pool's capacity is the real concurrency ceiling.
    async fn run_parallel(
        &self,
        executor: &HostExecutor<S>,
        batch_id: BatchId,
        command: &str,
        targets: Vec<HostTarget>,
        policy: ExecutionPolicy,
        cancel: &CancelFlag,
    ) -> (u32, u32) {
        let mut tasks = JoinSet::new();
        for target in targets {
            let executor = executor.clone();
            let command = command.to_string();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                executor
                    .run(batch_id, &target, &command, &policy, &cancel)
                    .await
            });
        }

        let (mut completed, mut failed) = (0u32, 0u32);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(HostOutcome::Completed) => completed += 1,
                Ok(HostOutcome::Failed) => {
                    failed += 1;
                    if policy.stop_on_first_error && cancel.set() {
                        tracing::warn!(%batch_id, "first host failure, stopping remaining hosts");
                    }
                }
                Ok(HostOutcome::Cancelled) => {}
                Err(err) => {
                    failed += 1;
                    tracing::error!(%batch_id, error = %err, "host task panicked");
                }
            }
        }
        (completed, failed)
    }

    /// One host at a time in target order. With stop_on_first_error, hosts
    /// after a terminal failure are never started and stay pending.
    async fn run_sequential(
        &self,
        executor: &HostExecutor<S>,
        batch_id: BatchId,
        command: &str,
        targets: Vec<HostTarget>,
        policy: ExecutionPolicy,
        cancel: &CancelFlag,
    ) -> (u32, u32) {
        let (mut completed, mut failed) = (0u32, 0u32);
        for target in targets {
            if cancel.is_set() {
                break;
            }
            match executor
                .run(batch_id, &target, command, &policy, cancel)
                .await
            {
                HostOutcome::Completed => completed += 1,
                HostOutcome::Failed => {
                    failed += 1;
                    if policy.stop_on_first_error {
                        tracing::warn!(
                            %batch_id,
                            host = %target.host_id,
                            "host failed, skipping remaining hosts"
                        );
                        break;
                    }
                }
                HostOutcome::Cancelled => break,
            }
        }
        (completed, failed)
    }

    async fn patch_batch(&self, batch_id: BatchId, patch: BatchPatch) {
        if let Err(err) = self.store.update_batch(batch_id, patch).await {
            tracing::error!(%batch_id, error = %err, "failed to persist batch record");
        }
    }
}
