//! Error taxonomy shared across the workspace.

use std::fmt;

use thiserror::Error;

use crate::model::{BatchId, ExecOutput};

/// Which output stream overflowed its buffer cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// Failure of a single command execution on a single host.
///
/// These never propagate past the host executor; after retries exhaust they
/// surface only as a terminal failed host result.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Transport or authentication failure.
    #[error("connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },

    /// Wall-clock limit exceeded; the stream was destroyed.
    #[error("command timed out after {timeout_secs}s on {host}")]
    Timeout { host: String, timeout_secs: u64 },

    /// Output cap hit. Terminal: the command itself is misbehaving.
    #[error("{stream} exceeded {limit} bytes on {host}")]
    BufferExceeded {
        host: String,
        stream: OutputStream,
        limit: usize,
    },

    /// Non-zero remote exit code. Not a transport failure.
    #[error("command exited with code {} on {host}", .output.exit_code)]
    Command { host: String, output: ExecOutput },

    /// No free pool slot within the acquire timeout.
    #[error("connection pool exhausted ({max} sessions open)")]
    PoolExhausted { max: usize },

    /// The pool was shut down.
    #[error("connection pool is closed")]
    PoolClosed,
}

impl ExecError {
    /// Whether the host executor should retry after this error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::BufferExceeded { .. } | Self::PoolClosed)
    }
}

/// Persistence gateway failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("batch not found: {0}")]
    BatchNotFound(BatchId),
    #[error("host {host} not found in batch {batch}")]
    HostNotFound { batch: BatchId, host: String },
    #[error("store error: {0}")]
    Internal(String),
}

/// Target resolution failure.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("caller does not own target: {0}")]
    Unauthorized(String),
    #[error("resolver error: {0}")]
    Internal(String),
}

/// Failure surfaced to the calling layer by the batch coordinator.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("command must not be empty")]
    EmptyCommand,
    #[error("no targets resolved for batch")]
    NoTargets,
    #[error("batch not found: {0}")]
    BatchNotFound(BatchId),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
