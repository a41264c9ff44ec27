//! In-process transactional driver
//!
//! Backs the pool with an in-memory table store so the pool, the
//! transaction runner and the HTTP layer can run without a MySQL server.
//! Writes made inside a transaction stay private to that connection until
//! commit and are discarded on rollback.
//!
//! Understood statements (keywords are case-insensitive):
//!
//! - `SELECT 1`
//! - `SELECT COUNT(*) FROM <table>`
//! - `SELECT * FROM <table> [WHERE <column> = ?]`
//! - `INSERT INTO <table> (<column>, ...) VALUES (?, ...)`
//! - `DELETE FROM <table> [WHERE <column> = ?]`
//!
//! Unknown tables read as empty and are created by their first insert.

use crate::db::error::DriverError;
use crate::db::session::{Row, Session};
use async_trait::async_trait;
use bb8::ManageConnection;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("unsupported statement: {0}")]
    Unsupported(String),

    #[error("statement expects {expected} parameters, got {got}")]
    ParamCount { expected: usize, got: usize },

    #[error("a transaction is already open on this connection")]
    NestedTransaction,

    #[error("connection refused")]
    ConnectRefused,

    #[error("connection has been closed")]
    Closed,

    #[error("injected {0} failure")]
    Injected(&'static str),
}

type Tables = BTreeMap<String, Vec<Row>>;

/// Committed data shared by every connection of one manager
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed rows of `table`, bypassing the pool
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock().get(table).cloned().unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, ops: Vec<WriteOp>) {
        let mut tables = self.lock();
        for op in ops {
            op.apply(&mut tables);
        }
    }
}

/// Switches for making the next operations fail
#[derive(Debug, Default)]
pub struct FaultPlan {
    pub connect: AtomicBool,
    pub begin: AtomicBool,
    pub commit: AtomicBool,
    pub rollback: AtomicBool,
    pub close: AtomicBool,
}

impl FaultPlan {
    fn check(flag: &AtomicBool, what: &'static str) -> Result<(), MemoryError> {
        if flag.load(Ordering::Acquire) {
            Err(MemoryError::Injected(what))
        } else {
            Ok(())
        }
    }
}

/// `bb8` manager producing [`MemorySession`]s over one shared store
#[derive(Debug, Clone, Default)]
pub struct MemoryConnectionManager {
    store: MemoryStore,
    faults: Arc<FaultPlan>,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl MemoryConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn faults(&self) -> &FaultPlan {
        &self.faults
    }

    /// Number of physical connections opened so far
    pub fn connections_opened(&self) -> usize {
        self.opened.load(Ordering::Acquire)
    }

    /// Number of connections explicitly closed so far
    pub fn connections_closed(&self) -> usize {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ManageConnection for MemoryConnectionManager {
    type Connection = MemorySession;
    type Error = MemoryError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        if self.faults.connect.load(Ordering::Acquire) {
            return Err(MemoryError::ConnectRefused);
        }
        let id = self.opened.fetch_add(1, Ordering::AcqRel) + 1;
        trace!("Opened memory connection #{}", id);

        Ok(MemorySession {
            id,
            store: self.store.clone(),
            faults: Arc::clone(&self.faults),
            closed: Arc::clone(&self.closed),
            pending: None,
            open: true,
        })
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.ping().await.map_err(|_| MemoryError::ConnectRefused)
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.pending.is_some() || !conn.open
    }
}

/// One connection to a [`MemoryStore`]
#[derive(Debug)]
pub struct MemorySession {
    id: usize,
    store: MemoryStore,
    faults: Arc<FaultPlan>,
    closed: Arc<AtomicUsize>,
    /// Writes buffered by the open transaction, if any
    pending: Option<Vec<WriteOp>>,
    open: bool,
}

impl MemorySession {
    pub fn id(&self) -> usize {
        self.id
    }

    fn ensure_open(&self) -> Result<(), MemoryError> {
        if self.open {
            Ok(())
        } else {
            Err(MemoryError::Closed)
        }
    }

    fn visible_rows(&self, table: &str) -> Vec<Row> {
        let mut tables = Tables::new();
        tables.insert(table.to_string(), self.store.rows(table));
        if let Some(pending) = &self.pending {
            for op in pending.iter().filter(|op| op.table() == table) {
                op.clone().apply(&mut tables);
            }
        }
        tables.remove(table).unwrap_or_default()
    }

    fn write(&mut self, op: WriteOp) {
        match &mut self.pending {
            Some(pending) => pending.push(op),
            None => self.store.apply(vec![op]),
        }
    }

    fn run(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, MemoryError> {
        self.ensure_open()?;
        let statement = Statement::parse(sql)?;
        let expected = statement.param_count();
        if expected != params.len() {
            return Err(MemoryError::ParamCount {
                expected,
                got: params.len(),
            });
        }

        match statement {
            Statement::SelectOne => Ok(vec![Row::new().with("1", 1)]),
            Statement::Count { table } => {
                let count = self.visible_rows(&table).len();
                Ok(vec![Row::new().with("COUNT(*)", count)])
            }
            Statement::Select { table, filter } => {
                let rows = self.visible_rows(&table);
                Ok(match filter {
                    Some(column) => rows
                        .into_iter()
                        .filter(|row| row.get(&column) == Some(&params[0]))
                        .collect(),
                    None => rows,
                })
            }
            Statement::Insert { table, columns } => {
                let row = columns
                    .into_iter()
                    .zip(params.iter().cloned())
                    .fold(Row::new(), |row, (column, value)| row.with(column, value));
                self.write(WriteOp::Insert { table, row });
                Ok(Vec::new())
            }
            Statement::Delete { table, filter } => {
                let filter = filter.map(|column| (column, params[0].clone()));
                self.write(WriteOp::Delete { table, filter });
                Ok(Vec::new())
            }
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DriverError> {
        Ok(self.run(sql, params)?)
    }

    async fn begin(&mut self) -> Result<(), DriverError> {
        self.ensure_open()?;
        FaultPlan::check(&self.faults.begin, "begin")?;
        if self.pending.is_some() {
            return Err(MemoryError::NestedTransaction.into());
        }
        self.pending = Some(Vec::new());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        FaultPlan::check(&self.faults.commit, "commit")?;
        if let Some(ops) = self.pending.take() {
            self.store.apply(ops);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        FaultPlan::check(&self.faults.rollback, "rollback")?;
        self.pending = None;
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), DriverError> {
        Ok(self.ensure_open()?)
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        self.pending = None;
        self.open = false;
        FaultPlan::check(&self.faults.close, "close")?;
        let total = self.closed.fetch_add(1, Ordering::AcqRel) + 1;
        trace!("Closed memory connection #{} ({} closed)", self.id, total);
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.pending.is_some()
    }
}

#[derive(Debug, Clone)]
enum WriteOp {
    Insert {
        table: String,
        row: Row,
    },
    Delete {
        table: String,
        filter: Option<(String, Value)>,
    },
}

impl WriteOp {
    fn table(&self) -> &str {
        match self {
            WriteOp::Insert { table, .. } | WriteOp::Delete { table, .. } => table,
        }
    }

    fn apply(self, tables: &mut Tables) {
        match self {
            WriteOp::Insert { table, row } => tables.entry(table).or_default().push(row),
            WriteOp::Delete { table, filter } => {
                if let Some(rows) = tables.get_mut(&table) {
                    match filter {
                        Some((column, value)) => rows.retain(|row| row.get(&column) != Some(&value)),
                        None => rows.clear(),
                    }
                }
            }
        }
    }
}

#[derive(Debug, PartialEq)]
enum Statement {
    SelectOne,
    Count { table: String },
    Select { table: String, filter: Option<String> },
    Insert { table: String, columns: Vec<String> },
    Delete { table: String, filter: Option<String> },
}

impl Statement {
    fn parse(sql: &str) -> Result<Self, MemoryError> {
        let unsupported = || MemoryError::Unsupported(sql.trim().to_string());
        let text = sql.trim().trim_end_matches(';').trim();
        let tokens: Vec<&str> = text.split_whitespace().collect();
        let upper: Vec<String> = tokens.iter().map(|t| t.to_ascii_uppercase()).collect();
        let upper: Vec<&str> = upper.iter().map(String::as_str).collect();

        match upper.as_slice() {
            ["SELECT", "1"] => Ok(Statement::SelectOne),
            ["SELECT", "COUNT(*)", "FROM", _] => Ok(Statement::Count {
                table: tokens[3].to_string(),
            }),
            ["SELECT", "*", "FROM", _] => Ok(Statement::Select {
                table: tokens[3].to_string(),
                filter: None,
            }),
            ["SELECT", "*", "FROM", _, "WHERE", _, "=", "?"] => Ok(Statement::Select {
                table: tokens[3].to_string(),
                filter: Some(tokens[5].to_string()),
            }),
            ["DELETE", "FROM", _] => Ok(Statement::Delete {
                table: tokens[2].to_string(),
                filter: None,
            }),
            ["DELETE", "FROM", _, "WHERE", _, "=", "?"] => Ok(Statement::Delete {
                table: tokens[2].to_string(),
                filter: Some(tokens[4].to_string()),
            }),
            ["INSERT", "INTO", ..] => Self::parse_insert(text).ok_or_else(unsupported),
            _ => Err(unsupported()),
        }
    }

    fn parse_insert(text: &str) -> Option<Self> {
        let after_into = text.to_ascii_uppercase().find("INTO")? + "INTO".len();
        let rest = text.get(after_into..)?.trim_start();
        let (table, rest) = rest.split_once('(')?;
        let (columns, rest) = rest.split_once(')')?;
        let rest = rest.trim_start();
        if !rest.to_ascii_uppercase().starts_with("VALUES") {
            return None;
        }
        let (_, values) = rest.split_once('(')?;
        let (values, _) = values.split_once(')')?;

        let columns: Vec<String> = columns.split(',').map(|c| c.trim().to_string()).collect();
        let placeholders = values.split(',').filter(|v| v.trim() == "?").count();
        if table.trim().is_empty() || columns.iter().any(String::is_empty) || placeholders != columns.len() {
            return None;
        }

        Some(Statement::Insert {
            table: table.trim().to_string(),
            columns,
        })
    }

    fn param_count(&self) -> usize {
        match self {
            Statement::SelectOne | Statement::Count { .. } => 0,
            Statement::Select { filter, .. } | Statement::Delete { filter, .. } => {
                usize::from(filter.is_some())
            }
            Statement::Insert { columns, .. } => columns.len(),
        }
    }
}
