//! Core abstractions for batch remote command dispatch.
//!
//! This crate provides the fundamental building blocks:
//! - Data model: `BatchExecution`, `HostResult`, `ExecutionPolicy`
//! - Error taxonomy: `ExecError`, `StoreError`, `ResolveError`, `CoordinatorError`
//! - Trait seams: `BatchStore`, `TargetResolver`, `Transport`, `RemoteShell`
//! - `CancelFlag` for cooperative batch cancellation

pub mod cancel;
pub mod error;
pub mod model;
pub mod resolver;
pub mod traits;

pub use cancel::CancelFlag;
pub use error::{CoordinatorError, ExecError, OutputStream, ResolveError, StoreError};
pub use model::{
    AuthMaterial, AuthSecret, BatchExecution, BatchId, BatchPatch, BatchStatus, ExecOutput,
    ExecutionPolicy, HostResult, HostResultPatch, HostStatus, HostTarget, NewBatch, Topology,
    epoch_ms,
};
pub use resolver::StaticResolver;
pub use traits::{
    BatchStore, RemoteShell, SpawnedCommand, TargetResolver, TargetSelector, Transport,
};
