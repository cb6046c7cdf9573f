//! Trait seams consumed by the execution core.
//!
//! `BatchStore` and `TargetResolver` face external collaborators (durable
//! record store, credential service). `Transport` and `RemoteShell` face the
//! authenticated remote-shell protocol implementation.

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::AsyncRead;

use crate::error::{ExecError, ResolveError, StoreError};
use crate::model::{
    BatchExecution, BatchId, BatchPatch, HostResult, HostResultPatch, HostTarget, NewBatch,
};

/// Durable record store for batch and per-host results.
///
/// Consumed, not owned: implementations serialize concurrent writes to
/// distinct rows themselves. Patches against terminal rows must be ignored,
/// never applied; a terminal status is never re-opened.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Create a batch record in pending state and return its id.
    async fn create_batch(&self, new: NewBatch) -> Result<BatchId, StoreError>;

    /// Fetch a batch record by id.
    async fn get_batch(&self, id: BatchId) -> Result<Option<BatchExecution>, StoreError>;

    /// Apply a partial update to a batch record.
    async fn update_batch(&self, id: BatchId, patch: BatchPatch) -> Result<(), StoreError>;

    /// Create one pending host result row per host, preserving order.
    async fn create_host_results(
        &self,
        batch_id: BatchId,
        host_ids: &[String],
    ) -> Result<(), StoreError>;

    /// Apply a partial update to one host result row.
    async fn update_host_result(
        &self,
        batch_id: BatchId,
        host_id: &str,
        patch: HostResultPatch,
    ) -> Result<(), StoreError>;

    /// List host result rows in submission order.
    async fn list_host_results(&self, batch_id: BatchId) -> Result<Vec<HostResult>, StoreError>;
}

/// What the caller addressed a batch at.
#[derive(Debug, Clone)]
pub enum TargetSelector {
    /// A named server group.
    Group(String),
    /// Explicit host ids.
    Hosts(Vec<String>),
}

/// Resolves a selector to concrete host targets, enforcing ownership.
#[async_trait]
pub trait TargetResolver: Send + Sync {
    /// Resolve the selector for the given caller.
    ///
    /// # Errors
    /// `Unauthorized` if any addressed host is not owned by the caller.
    async fn resolve(
        &self,
        selector: &TargetSelector,
        caller_id: &str,
    ) -> Result<Vec<HostTarget>, ResolveError>;
}

/// Byte streams and exit status of one spawned remote command.
pub struct SpawnedCommand {
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
    /// Resolves once the remote command exits.
    pub exit: BoxFuture<'static, Result<i32, ExecError>>,
}

/// One authenticated remote-shell connection.
#[async_trait]
pub trait RemoteShell: Send {
    /// Start a command on the remote host.
    async fn spawn(&mut self, command: &str) -> Result<SpawnedCommand, ExecError>;

    /// Tear down the connection. Any in-flight command stream is destroyed.
    async fn close(&mut self);

    /// Whether the connection is still usable.
    fn is_open(&self) -> bool;
}

/// Opens authenticated remote-shell connections.
///
/// Connecting performs the real handshake; failures surface as
/// `ExecError::Connection` carrying the host and reason.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, target: &HostTarget) -> Result<Box<dyn RemoteShell>, ExecError>;
}
