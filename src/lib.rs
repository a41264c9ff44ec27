pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod logging;
pub mod rate_limit;
pub mod server;

pub use config::{AppConfig, ConfigError, Environment};
pub use db::{ConnectionPool, DbError, TransactionRunner};
pub use error::{ApiError, Result};
