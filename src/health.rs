//! Health check and monitoring module
//!
//! Liveness is static; readiness and the detailed status report go through
//! the connection pool so they reflect whether MySQL is actually reachable.

use crate::config::Environment;
use crate::db::{ConnectionPool, Driver, PoolStats};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument};

/// Above this round-trip time the database is reported as degraded
const SLOW_PING: Duration = Duration::from_secs(1);

/// Above this share of borrowed connections the pool is reported as degraded
const BUSY_POOL_PERCENT: f64 = 80.0;

/// Overall health status of the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Connection pool occupancy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionPoolHealth {
    pub active: u32,
    pub idle: u32,
    pub max: u32,
    pub waiting: usize,
    pub utilization_percent: f64,
}

impl From<&PoolStats> for ConnectionPoolHealth {
    fn from(stats: &PoolStats) -> Self {
        Self {
            active: stats.active,
            idle: stats.idle,
            max: stats.max_size,
            waiting: stats.waiting,
            utilization_percent: stats.utilization_percent(),
        }
    }
}

/// MySQL reachability and pool state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseHealth {
    pub status: HealthStatus,
    pub latency_ms: u64,
    pub connection_pool: ConnectionPoolHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Response of `GET /status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub status: HealthStatus,
    pub version: String,
    pub environment: Environment,
    pub uptime_seconds: u64,
    pub database: DatabaseHealth,
    pub timestamp: u64, // Unix timestamp
}

pub struct HealthService<M: Driver> {
    pool: ConnectionPool<M>,
    environment: Environment,
    start_time: Instant,
}

impl<M: Driver> Clone for HealthService<M> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            environment: self.environment,
            start_time: self.start_time,
        }
    }
}

impl<M: Driver> HealthService<M> {
    pub fn new(pool: ConnectionPool<M>, environment: Environment) -> Self {
        Self {
            pool,
            environment,
            start_time: Instant::now(),
        }
    }

    pub fn pool(&self) -> &ConnectionPool<M> {
        &self.pool
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Ping MySQL through the pool and grade the result
    #[instrument(skip(self))]
    pub async fn check_database(&self) -> DatabaseHealth {
        let start = Instant::now();
        let reachable = self.pool.health_check().await;
        let latency = start.elapsed();
        let stats = self.pool.stats();

        let (status, message) = if !reachable {
            (
                HealthStatus::Unhealthy,
                Some("Database is unreachable".to_string()),
            )
        } else if latency > SLOW_PING {
            (HealthStatus::Degraded, Some("High latency".to_string()))
        } else if stats.utilization_percent() > BUSY_POOL_PERCENT {
            (
                HealthStatus::Degraded,
                Some("High connection pool utilization".to_string()),
            )
        } else {
            (HealthStatus::Healthy, None)
        };
        debug!("Database health: {:?} in {:?}", status, latency);

        DatabaseHealth {
            status,
            latency_ms: latency.as_millis() as u64,
            connection_pool: ConnectionPoolHealth::from(&stats),
            message,
        }
    }

    /// Comprehensive status with database and pool details
    pub async fn get_detailed_status(&self) -> ServiceStatus {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();

        let database = self.check_database().await;

        ServiceStatus {
            // The database is the only dependency, so it decides
            status: database.status,
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: self.environment,
            uptime_seconds: self.uptime().as_secs(),
            database,
            timestamp,
        }
    }
}
