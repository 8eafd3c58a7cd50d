pub mod cockroach;
pub mod config;
pub mod conformance;
pub mod entry;
pub mod error;
pub mod harness;
pub mod memory;
pub mod path;
pub mod redb;
pub mod retry;
pub mod sql;
pub mod sqlite;
pub mod traits;

pub use cockroach::{CockroachBackend, CockroachConfig};
pub use config::{BackendConfig, BackendKind, RetryConfig, new_backend};
pub use entry::{Entry, Operation};
pub use error::PhysicalError;
pub use memory::MemoryBackend;
pub use self::redb::RedbBackend;
pub use retry::{RetryPolicy, retry_on_abort};
pub use sqlite::SqliteBackend;
pub use traits::{Backend, Transactional, Txn, TxnBody};
