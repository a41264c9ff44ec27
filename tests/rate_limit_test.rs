//! Global rate limit applied in front of every route

use axum::http::StatusCode;
use axum_test::TestServer;
use onfocus_api::config::RateLimitConfig;
use onfocus_api::db::{ConnectionPool, MemoryConnectionManager};
use onfocus_api::rate_limit::RateLimiter;
use onfocus_api::server::{AppState, create_router};
use onfocus_api::Environment;

fn limited_server(limit: u32) -> TestServer {
    let pool = ConnectionPool::builder(MemoryConnectionManager::new())
        .build()
        .unwrap();
    let limiter = RateLimiter::new(&RateLimitConfig {
        window_secs: 60,
        limit,
        message: "Slow down".to_string(),
        ..Default::default()
    });
    TestServer::new(create_router(AppState::new(pool, Environment::Test), limiter)).unwrap()
}

#[tokio::test]
async fn test_rate_limit_headers_count_down() {
    let server = limited_server(3);

    let first = server.get("/health").await;
    assert_eq!(first.status_code(), StatusCode::OK);
    assert_eq!(first.header("ratelimit-limit"), "3");
    assert_eq!(first.header("ratelimit-policy"), "3;w=60");
    assert!(first.headers().get("retry-after").is_none());
    assert_eq!(first.header("ratelimit-remaining"), "2");

    let reset: u64 = first.header("ratelimit-reset").to_str().unwrap().parse().unwrap();
    assert!(reset > 0 && reset <= 60);

    let second = server.get("/status").await;
    assert_eq!(second.header("ratelimit-remaining"), "1");
}

#[tokio::test]
async fn test_requests_over_limit_are_rejected() {
    let server = limited_server(2);

    server.get("/health").await;
    server.get("/db-check").await;
    let rejected = server.get("/health").await;

    assert_eq!(rejected.status_code(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(rejected.text(), "Slow down");
    assert_eq!(rejected.header("ratelimit-remaining"), "0");
    assert!(rejected.headers().get("x-ratelimit-limit").is_none());
}

#[tokio::test]
async fn test_rejection_carries_policy_and_retry_after() {
    let server = limited_server(1);

    server.get("/health").await;
    let rejected = server.get("/health").await;

    assert_eq!(rejected.status_code(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(rejected.header("ratelimit-policy"), "1;w=60");

    let retry_after: u64 = rejected.header("retry-after").to_str().unwrap().parse().unwrap();
    let reset: u64 = rejected.header("ratelimit-reset").to_str().unwrap().parse().unwrap();
    assert_eq!(retry_after, reset);
    assert!(retry_after > 0 && retry_after <= 60);
}

#[tokio::test]
async fn test_limit_is_shared_across_routes() {
    let server = limited_server(1);

    assert_eq!(server.get("/status").await.status_code(), StatusCode::OK);
    assert_eq!(
        server.get("/db-check").await.status_code(),
        StatusCode::TOO_MANY_REQUESTS
    );
}
