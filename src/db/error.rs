//! Error taxonomy for the data-access layer
//!
//! Every variant keeps the driver error as its `source`, so callers can
//! walk the full cause chain. Nothing in this layer logs an error it
//! returns; logging happens once at the outermost boundary.

use crate::config::ConfigError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Boxed error produced by a database driver
pub type DriverError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type DbResult<T> = std::result::Result<T, DbError>;

/// The transaction step that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStage {
    Begin,
    Commit,
    Rollback,
}

impl fmt::Display for TxStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxStage::Begin => write!(f, "begin"),
            TxStage::Commit => write!(f, "commit"),
            TxStage::Rollback => write!(f, "rollback"),
        }
    }
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("connection pool exhausted after waiting {waited:?}")]
    PoolExhausted { waited: Duration },

    #[error("failed to open database connection: {0}")]
    Connection(#[source] DriverError),

    #[error("query failed ({sql}): {source}")]
    Query {
        sql: String,
        #[source]
        source: DriverError,
    },

    #[error("transaction {stage} failed: {source}")]
    Transaction {
        stage: TxStage,
        #[source]
        source: DriverError,
    },

    #[error("connection pool is already closed")]
    AlreadyClosed,

    #[error("failed to close {failed} database connection(s): {source}")]
    Close {
        failed: usize,
        #[source]
        source: DriverError,
    },
}

impl DbError {
    pub(crate) fn query(sql: &str, source: DriverError) -> Self {
        DbError::Query {
            sql: sql_preview(sql),
            source,
        }
    }

    pub(crate) fn transaction(stage: TxStage, source: DriverError) -> Self {
        DbError::Transaction { stage, source }
    }

    /// Whether retrying later may succeed without any change by the caller
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::PoolExhausted { .. } | DbError::Connection(_))
    }
}

/// Single-line, length-capped rendering of a statement for error context
/// and span fields. Parameters are never included.
pub(crate) fn sql_preview(sql: &str) -> String {
    const MAX: usize = 80;
    let flat = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= MAX {
        flat
    } else {
        let cut: String = flat.chars().take(MAX).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_preview_flattens_whitespace() {
        let sql = "SELECT id,\n       name\n  FROM users\n WHERE id = ?";
        assert_eq!(sql_preview(sql), "SELECT id, name FROM users WHERE id = ?");
    }

    #[test]
    fn test_sql_preview_truncates_long_statements() {
        let sql = format!("SELECT {}", "x, ".repeat(100));
        let preview = sql_preview(&sql);
        assert!(preview.ends_with("..."));
        assert_eq!(preview.chars().count(), 83);
    }

    #[test]
    fn test_error_messages_carry_context() {
        let err = DbError::query("SELECT * FROM missing", "table does not exist".into());
        let message = err.to_string();
        assert!(message.contains("SELECT * FROM missing"));
        assert!(message.contains("table does not exist"));

        let err = DbError::transaction(TxStage::Commit, "lost connection".into());
        assert!(err.to_string().contains("commit"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_transient_classification() {
        assert!(DbError::PoolExhausted { waited: Duration::from_millis(5) }.is_transient());
        assert!(DbError::Connection("refused".into()).is_transient());
        assert!(!DbError::AlreadyClosed.is_transient());
    }
}
