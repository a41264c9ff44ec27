use crate::config::{AppConfig, Environment};
use crate::db::{ConnectionPool, Driver};
use crate::health::{HealthService, HealthStatus, ServiceStatus};
use crate::rate_limit::{self, RateLimiter};
use crate::{ApiError, Result};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::get,
};
use serde_json::{Value, json};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Shared handler state; cloned per request
pub struct AppState<M: Driver> {
    pub pool: ConnectionPool<M>,
    pub health: HealthService<M>,
}

impl<M: Driver> Clone for AppState<M> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            health: self.health.clone(),
        }
    }
}

impl<M: Driver> AppState<M> {
    pub fn new(pool: ConnectionPool<M>, environment: Environment) -> Self {
        Self {
            health: HealthService::new(pool.clone(), environment),
            pool,
        }
    }
}

/// Build the router with every route behind the rate limiter
pub fn create_router<M: Driver>(state: AppState<M>, limiter: RateLimiter) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/db-check", get(db_check::<M>))
        .route("/status", get(service_status::<M>))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn_with_state(limiter, rate_limit::enforce)),
        )
        .with_state(state)
}

/// Bind the configured address and serve until SIGINT or SIGTERM
pub async fn start_server<M: Driver>(config: &AppConfig, pool: ConnectionPool<M>) -> Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;

    info!(
        "Starting OnFocus API on {} ({})",
        addr, config.environment
    );
    if let Some(base_url) = &config.server.base_url {
        info!("Public URL: {}", base_url);
    }

    let state = AppState::new(pool, config.environment);
    let limiter = RateLimiter::new(&config.rate_limit);
    serve(listener, state, limiter, shutdown_signal()).await
}

/// Serve on an already bound listener until `shutdown` resolves
///
/// The pool is closed once the listener has stopped and in-flight
/// requests have finished.
pub async fn serve<M, S>(
    listener: TcpListener,
    state: AppState<M>,
    limiter: RateLimiter,
    shutdown: S,
) -> Result<()>
where
    M: Driver,
    S: Future<Output = ()> + Send + 'static,
{
    let pool = state.pool.clone();
    let app = create_router(state, limiter);

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await;

    info!("HTTP listener stopped, closing connection pool");
    let closed = pool.close().await;

    served?;
    closed?;
    Ok(())
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(signal = "SIGINT", "Shutdown signal received"),
        _ = terminate => info!(signal = "SIGTERM", "Shutdown signal received"),
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "OnFocus API OK" }))
}

async fn db_check<M: Driver>(State(state): State<AppState<M>>) -> Result<Json<Value>> {
    let start = Instant::now();
    let rows = state.pool.query("SELECT 1", &[]).await?;
    if rows.len() != 1 {
        return Err(ApiError::Internal(format!(
            "SELECT 1 returned {} rows",
            rows.len()
        )));
    }

    Ok(Json(json!({
        "status": "ok",
        "latency_ms": start.elapsed().as_millis() as u64,
    })))
}

async fn service_status<M: Driver>(State(state): State<AppState<M>>) -> impl IntoResponse {
    let status: ServiceStatus = state.health.get_detailed_status().await;
    let code = match status.status {
        HealthStatus::Unhealthy => {
            warn!("Status check reports the database as unhealthy");
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::OK,
    };
    (code, Json(status))
}
