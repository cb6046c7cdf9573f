//! Remote-shell session handling for batch command dispatch.
//!
//! Provides:
//! - `RemoteSession` - exec with wall-clock timeout and output caps
//! - `ConnectionPool` - keyed session cache with capacity bound and idle sweep

pub mod pool;
pub mod session;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use pool::{ConnectionPool, PoolConfig, PooledSession};
pub use session::{RemoteSession, SessionLimits};
