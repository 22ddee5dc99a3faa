//! Storage backends for monitoring records
//!
//! - **SQLite** (default feature `storage-sqlite`): embedded database file
//! - **In-Memory**: ring buffers, used when storage is disabled and in tests
//!
//! Backends are only ever written by the storage actor; the monitoring core
//! talks to it through [`crate::sink::PersistenceSink`].
//!
//! ```no_run
//! use homewatch::storage::{StorageBackend, sqlite::SqliteBackend};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = SqliteBackend::new("./homewatch.db").await?;
//!     println!("{}", backend.get_stats().await?);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod memory;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use backend::{HealthStatus, StorageBackend};
pub use error::{StorageError, StorageResult};
