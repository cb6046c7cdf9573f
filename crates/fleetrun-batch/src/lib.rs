//! Batch orchestration and storage backends.
//!
//! Provides:
//! - `BatchCoordinator` - submit/cancel/status for multi-host command batches
//! - Storage backends (memory, SQLite) implementing `BatchStore`

pub mod coordinator;
pub mod storage;

pub use coordinator::BatchCoordinator;

#[cfg(feature = "memory")]
pub use storage::MemoryStore;

#[cfg(feature = "sqlite")]
pub use storage::SqliteStore;
