//! Transactional database access
//!
//! Connection pooling is provided by `bb8`; this module adds the process
//! lifecycle around it, a scoped lease for every borrowed connection, and
//! the transaction runner built on top of that lease.

pub mod connection_manager;
pub mod error;
#[cfg(any(test, feature = "test-helpers"))]
pub mod memory;
pub mod pool;
pub mod session;
pub mod transaction;

pub use connection_manager::{MySqlConnectionConfig, MySqlConnectionManager, MySqlSession};
pub use error::{DbError, DbResult, DriverError, TxStage};
#[cfg(any(test, feature = "test-helpers"))]
pub use memory::{MemoryConnectionManager, MemoryStore};
pub use pool::{ConnectionPool, ConnectionPoolBuilder, Lease, PoolStats};
pub use session::{Driver, Row, Session};
pub use transaction::TransactionRunner;

// Re-export for callers writing unit-of-work closures
pub use futures::future::BoxFuture;
