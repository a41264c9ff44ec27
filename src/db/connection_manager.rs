//! MySQL connection manager for the bb8 pool
//!
//! Implements `bb8::ManageConnection` over `sqlx` MySQL connections that
//! always verify the server certificate against a configured CA.

use crate::config::{ConfigError, DatabaseConfig};
use crate::db::error::DriverError;
use crate::db::session::{Row, Session};
use async_trait::async_trait;
use bb8::ManageConnection;
use serde_json::Value;
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlRow, MySqlSslMode};
use sqlx::query::Query;
use sqlx::{Column, Connection, Executor, MySql, Row as _, TypeInfo};
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Errors raised while opening or validating a pooled connection
#[derive(Error, Debug)]
pub enum ConnectionManagerError {
    #[error("failed to open MySQL connection: {0}")]
    Connect(#[from] sqlx::Error),

    #[error("connection validation failed: {0}")]
    ValidationFailed(String),

    #[error("connection has been closed")]
    Closed,
}

/// Everything needed to open one TLS-secured MySQL connection
#[derive(Clone)]
pub struct MySqlConnectionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    /// PEM bytes of the certificate authority, read once at construction
    ca_pem: Vec<u8>,
}

impl fmt::Debug for MySqlConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MySqlConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("ca_pem_bytes", &self.ca_pem.len())
            .finish()
    }
}

impl MySqlConnectionConfig {
    /// Build from validated settings, reading the CA file eagerly so that an
    /// unreadable certificate stops startup instead of the first request.
    pub fn from_database_config(config: &DatabaseConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let ca_pem = std::fs::read(&config.ssl_ca).map_err(|source| ConfigError::UnreadableCa {
            path: config.ssl_ca.clone(),
            source,
        })?;
        if ca_pem.is_empty() {
            return Err(ConfigError::Invalid {
                key: "database.ssl_ca",
                reason: format!("{} is empty", config.ssl_ca.display()),
            });
        }

        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            user: config.user.clone(),
            password: config.password.clone(),
            database: config.database.clone(),
            ca_pem,
        })
    }

    fn connect_options(&self) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
            .ssl_mode(MySqlSslMode::VerifyCa)
            .ssl_ca_from_pem(self.ca_pem.clone())
    }
}

/// Connection manager handing out [`MySqlSession`]s to the pool
#[derive(Clone)]
pub struct MySqlConnectionManager {
    config: MySqlConnectionConfig,
    options: MySqlConnectOptions,
}

impl MySqlConnectionManager {
    pub fn new(config: MySqlConnectionConfig) -> Self {
        debug!("Creating MySQL connection manager for {}:{}", config.host, config.port);
        let options = config.connect_options();
        Self { config, options }
    }

    pub fn config(&self) -> &MySqlConnectionConfig {
        &self.config
    }
}

impl fmt::Debug for MySqlConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MySqlConnectionManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for MySqlConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MySqlConnectionManager({}:{}/{})",
            self.config.host, self.config.port, self.config.database
        )
    }
}

#[async_trait]
impl ManageConnection for MySqlConnectionManager {
    type Connection = MySqlSession;
    type Error = ConnectionManagerError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        debug!("Opening new MySQL connection");

        let conn = MySqlConnection::connect_with(&self.options).await?;

        Ok(MySqlSession::new(conn))
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.ping().await.map_err(|e| {
            debug!("MySQL connection failed validation: {}", e);
            ConnectionManagerError::ValidationFailed(e.to_string())
        })
    }

    /// A connection returned mid-transaction (its owner was cancelled),
    /// one that hit a transport error, or one already closed is dropped
    /// instead of reused.
    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.broken || conn.in_tx || conn.conn.is_none()
    }
}

/// One checked-out MySQL connection plus the state the pool needs
pub struct MySqlSession {
    /// `None` once closed
    conn: Option<MySqlConnection>,
    in_tx: bool,
    broken: bool,
}

impl fmt::Debug for MySqlSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MySqlSession")
            .field("in_tx", &self.in_tx)
            .field("broken", &self.broken)
            .field("closed", &self.conn.is_none())
            .finish()
    }
}

impl MySqlSession {
    fn new(conn: MySqlConnection) -> Self {
        Self {
            conn: Some(conn),
            in_tx: false,
            broken: false,
        }
    }

    fn track(&mut self, err: sqlx::Error) -> DriverError {
        if matches!(
            err,
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) | sqlx::Error::WorkerCrashed
        ) {
            self.broken = true;
        }
        Box::new(err)
    }

    fn live(&mut self) -> Result<&mut MySqlConnection, DriverError> {
        self.conn
            .as_mut()
            .ok_or_else(|| Box::new(ConnectionManagerError::Closed) as DriverError)
    }

    async fn run_control(&mut self, sql: &'static str) -> Result<(), DriverError> {
        let conn = self.live()?;
        match conn.execute(sql).await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.track(e)),
        }
    }
}

#[async_trait]
impl Session for MySqlSession {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DriverError> {
        let query = params
            .iter()
            .fold(sqlx::query::<MySql>(sql), |query, param| bind_value(query, param));

        let conn = self.live()?;
        match query.fetch_all(conn).await {
            Ok(rows) => Ok(rows.iter().map(decode_row).collect()),
            Err(e) => Err(self.track(e)),
        }
    }

    async fn begin(&mut self) -> Result<(), DriverError> {
        self.run_control("START TRANSACTION").await?;
        self.in_tx = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        self.run_control("COMMIT").await?;
        self.in_tx = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.run_control("ROLLBACK").await?;
        self.in_tx = false;
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), DriverError> {
        let conn = self.live()?;
        match conn.ping().await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.track(e)),
        }
    }

    /// Sends COM_QUIT and shuts the socket down
    async fn close(&mut self) -> Result<(), DriverError> {
        self.in_tx = false;
        match self.conn.take() {
            Some(conn) => {
                conn.close().await?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn in_transaction(&self) -> bool {
        self.in_tx
    }
}

fn bind_value<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: &Value,
) -> Query<'q, MySql, MySqlArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else if let Some(u) = n.as_u64() {
                query.bind(u)
            } else {
                query.bind(n.as_f64())
            }
        }
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(sqlx::types::Json(other.clone())),
    }
}

fn decode_row(row: &MySqlRow) -> Row {
    let mut out = Row::new();
    for column in row.columns() {
        let value = decode_column(row, column.ordinal(), column.type_info().name());
        out.insert(column.name(), value);
    }
    out
}

fn decode_column(row: &MySqlRow, idx: usize, type_name: &str) -> Value {
    let typed = match type_name {
        "BOOLEAN" => row.try_get::<Option<bool>, _>(idx).map(|v| v.map(Value::from)),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
            row.try_get::<Option<i64>, _>(idx).map(|v| v.map(Value::from))
        }
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
        | "BIGINT UNSIGNED" => row.try_get::<Option<u64>, _>(idx).map(|v| v.map(Value::from)),
        "FLOAT" | "DOUBLE" => row.try_get::<Option<f64>, _>(idx).map(|v| v.map(Value::from)),
        "JSON" => row
            .try_get::<Option<sqlx::types::Json<Value>>, _>(idx)
            .map(|v| v.map(|json| json.0)),
        "DATETIME" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(idx)
            .map(|v| v.map(|dt| Value::from(dt.to_string()))),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx)
            .map(|v| v.map(|dt| Value::from(dt.to_rfc3339()))),
        "DATE" => row
            .try_get::<Option<chrono::NaiveDate>, _>(idx)
            .map(|v| v.map(|d| Value::from(d.to_string()))),
        "TIME" => row
            .try_get::<Option<chrono::NaiveTime>, _>(idx)
            .map(|v| v.map(|t| Value::from(t.to_string()))),
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" => row
            .try_get::<Option<Vec<u8>>, _>(idx)
            .map(|v| v.map(|bytes| Value::from(String::from_utf8_lossy(&bytes).into_owned()))),
        "NULL" => Ok(None),
        _ => row.try_get_unchecked::<Option<String>, _>(idx).map(|v| v.map(Value::from)),
    };

    match typed {
        Ok(value) => value.unwrap_or(Value::Null),
        Err(e) => {
            // DECIMAL and other text-encoded types land here
            debug!("Falling back to text decoding for {} column {}: {}", type_name, idx, e);
            row.try_get_unchecked::<Option<String>, _>(idx)
                .ok()
                .flatten()
                .map(Value::from)
                .unwrap_or(Value::Null)
        }
    }
}
