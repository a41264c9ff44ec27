//! Fixed-window request rate limiting keyed by client address
//!
//! Each client gets a counter that lives for one window. Counters are kept
//! in a Moka cache whose time-to-live equals the window, so an expired
//! window simply disappears and the next request opens a fresh one.

use crate::config::RateLimitConfig;
use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use moka::future::Cache;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

pub const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
pub const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
pub const RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");
pub const RATELIMIT_POLICY: HeaderName = HeaderName::from_static("ratelimit-policy");

/// Who a request is counted against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientKey {
    Ip(IpAddr),
    /// Peer address not available; all such requests share one bucket
    Unknown,
}

impl ClientKey {
    pub fn from_request(request: &Request) -> Self {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| ClientKey::Ip(addr.ip()))
            .unwrap_or(ClientKey::Unknown)
    }
}

#[derive(Debug)]
struct Window {
    opened: Instant,
    hits: AtomicU32,
}

/// Outcome of counting one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the current window closes
    pub reset: Duration,
    pub window: Duration,
}

impl RateDecision {
    /// Whole seconds until reset, rounded up so clients never retry early
    pub fn reset_secs(&self) -> u64 {
        self.reset.as_millis().div_ceil(1000) as u64
    }

    /// `<limit>;w=<window seconds>`
    pub fn policy(&self) -> String {
        format!("{};w={}", self.limit, self.window.as_secs())
    }

    fn write_headers(&self, headers: &mut HeaderMap) {
        if let Ok(policy) = HeaderValue::from_str(&self.policy()) {
            headers.insert(RATELIMIT_POLICY, policy);
        }
        headers.insert(RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(RATELIMIT_RESET, HeaderValue::from(self.reset_secs()));
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    windows: Cache<ClientKey, Arc<Window>>,
    limit: u32,
    window: Duration,
    message: Arc<str>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let windows = Cache::builder()
            .max_capacity(config.max_tracked_clients)
            .time_to_live(config.window())
            .build();

        Self {
            windows,
            limit: config.limit,
            window: config.window(),
            message: Arc::from(config.message.as_str()),
        }
    }

    /// Count one request from `key`
    #[instrument(skip(self))]
    pub async fn check(&self, key: ClientKey) -> RateDecision {
        let window = self
            .windows
            .get_with(key, async {
                Arc::new(Window {
                    opened: Instant::now(),
                    hits: AtomicU32::new(0),
                })
            })
            .await;

        let hits = window.hits.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        let allowed = hits <= self.limit;
        if !allowed {
            debug!("Client over limit: {} requests this window", hits);
        }

        RateDecision {
            allowed,
            limit: self.limit,
            remaining: self.limit.saturating_sub(hits),
            reset: self.window.saturating_sub(window.opened.elapsed()),
            window: self.window,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Axum middleware enforcing the limiter on every request
pub async fn enforce(
    State(limiter): State<RateLimiter>,
    request: Request,
    next: Next,
) -> Response {
    let decision = limiter.check(ClientKey::from_request(&request)).await;

    let mut response = if decision.allowed {
        next.run(request).await
    } else {
        let mut rejected = (StatusCode::TOO_MANY_REQUESTS, Body::from(limiter.message().to_owned()))
            .into_response();
        rejected.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        rejected
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(decision.reset_secs()));
        rejected
    };

    decision.write_headers(response.headers_mut());
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: u32, window: Duration) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            window_secs: window.as_secs(),
            limit,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_allows_within_limit() {
        let limiter = limiter(3, Duration::from_secs(60));
        let key = ClientKey::Ip("127.0.0.1".parse().unwrap());

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.check(key).await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let decision = limiter.check(key).await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(decision.reset <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_clients_are_counted_independently() {
        let limiter = limiter(1, Duration::from_secs(60));
        let key_a = ClientKey::Ip("10.0.0.1".parse().unwrap());
        let key_b = ClientKey::Ip("10.0.0.2".parse().unwrap());

        assert!(limiter.check(key_a).await.allowed);
        assert!(!limiter.check(key_a).await.allowed);
        assert!(limiter.check(key_b).await.allowed);
        assert!(limiter.check(ClientKey::Unknown).await.allowed);
    }

    #[tokio::test]
    async fn test_window_expiry_resets_count() {
        let limiter = limiter(1, Duration::from_secs(1));
        let key = ClientKey::Unknown;

        assert!(limiter.check(key).await.allowed);
        assert!(!limiter.check(key).await.allowed);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(limiter.check(key).await.allowed);
    }

    #[test]
    fn test_reset_header_rounds_up() {
        let decision = RateDecision {
            allowed: true,
            limit: 100,
            remaining: 99,
            reset: Duration::from_millis(1500),
            window: Duration::from_secs(900),
        };
        let mut headers = HeaderMap::new();
        decision.write_headers(&mut headers);

        assert_eq!(headers[&RATELIMIT_POLICY], "100;w=900");
        assert_eq!(headers[&RATELIMIT_LIMIT], "100");
        assert_eq!(headers[&RATELIMIT_REMAINING], "99");
        assert_eq!(headers[&RATELIMIT_RESET], "2");
    }
}
