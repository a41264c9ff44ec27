//! Driver-facing connection abstraction
//!
//! The pool hands out connections produced by a `bb8::ManageConnection`.
//! Any manager whose connection implements [`Session`] can back the pool,
//! which is what keeps the pool and transaction runner driver-agnostic.

use crate::db::error::DriverError;
use async_trait::async_trait;
use bb8::ManageConnection;
use serde::Serialize;
use serde_json::{Map, Value};

/// One result row: column name to value, in select-list order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Row(Map<String, Value>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Row {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// A live database connection as seen by the pool and transaction runner
#[async_trait]
pub trait Session: Send + 'static {
    /// Run one parameterized statement and collect every result row.
    /// Statements that return no result set yield an empty vector.
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DriverError>;

    async fn begin(&mut self) -> Result<(), DriverError>;

    async fn commit(&mut self) -> Result<(), DriverError>;

    async fn rollback(&mut self) -> Result<(), DriverError>;

    /// Cheap liveness probe
    async fn ping(&mut self) -> Result<(), DriverError>;

    /// End the connection with the server. The session is unusable
    /// afterwards and its manager reports it broken.
    async fn close(&mut self) -> Result<(), DriverError>;

    /// True between a successful `begin` and the matching `commit`/`rollback`
    fn in_transaction(&self) -> bool;
}

/// A `bb8` connection manager whose connections are [`Session`]s
pub trait Driver:
    ManageConnection<Connection: Session, Error: std::error::Error + Send + Sync + 'static>
{
}

impl<M> Driver for M
where
    M: ManageConnection,
    M::Connection: Session,
    M::Error: std::error::Error + Send + Sync + 'static,
{
}
