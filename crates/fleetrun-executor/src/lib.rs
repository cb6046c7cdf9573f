//! Per-host execution for batch command dispatch.
//!
//! `HostExecutor` drives exactly one host result through zero or more
//! retries: acquire a pooled session, run the batch command, persist the
//! outcome, back off and repeat on transient failure.

pub mod host;

pub use host::{HostExecutor, HostOutcome};
