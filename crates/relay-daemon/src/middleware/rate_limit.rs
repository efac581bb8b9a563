//! Per-token fixed-window rate limiting.
//!
//! Independent of the daily run quota: this bounds raw request pressure per
//! bearer token per minute. Unauthenticated requests are limited per empty
//! key and rejected downstream anyway; `/healthz` is exempt.

use std::{
    collections::HashMap,
    convert::Infallible,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use http::HeaderValue;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tower::{Layer, Service};
use tracing::warn;

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub requests_per_window: u64,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 120,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct WindowSlot {
    window_start: Instant,
    count: u64,
}

struct RateLimitState {
    config: RateLimitConfig,
    windows: Mutex<HashMap<u64, WindowSlot>>,
}

impl RateLimitState {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the seconds to wait when the caller is over budget.
    async fn check(&self, key: u64) -> Option<u64> {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();
        let slot = windows.entry(key).or_insert(WindowSlot {
            window_start: now,
            count: 0,
        });
        if now.duration_since(slot.window_start) >= self.config.window {
            slot.window_start = now;
            slot.count = 0;
        }
        if slot.count >= self.config.requests_per_window {
            let elapsed = now.duration_since(slot.window_start);
            let retry_after = self.config.window.saturating_sub(elapsed).as_secs().max(1);
            return Some(retry_after);
        }
        slot.count += 1;
        None
    }
}

#[derive(Clone)]
pub struct RateLimitLayer {
    state: Arc<RateLimitState>,
}

pub fn rate_limit_layer(config: RateLimitConfig) -> RateLimitLayer {
    RateLimitLayer {
        state: Arc::new(RateLimitState::new(config)),
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            state: self.state.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    state: Arc<RateLimitState>,
}

#[derive(Debug, Serialize)]
struct RateLimitBody {
    error: &'static str,
}

impl<S, ReqBody> Service<Request<ReqBody>> for RateLimitService<S>
where
    S: Service<Request<ReqBody>, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let state = self.state.clone();
        let mut inner = self.inner.clone();
        Box::pin(async move {
            if request.uri().path() == "/healthz" {
                return inner.call(request).await;
            }

            let key = token_key(
                request
                    .headers()
                    .get(header::AUTHORIZATION)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or(""),
            );
            if let Some(retry_after) = state.check(key).await {
                warn!(retry_after, "request rate limited");
                let body = axum::Json(RateLimitBody {
                    error: "rate limit exceeded",
                });
                let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
                if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                return Ok(response);
            }

            inner.call(request).await
        })
    }
}

/// Bucket identity derived from the bearer token fingerprint; raw tokens
/// never sit in the window map.
fn token_key(authorization: &str) -> u64 {
    let digest = Sha256::digest(authorization.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn window_limits_and_resets() {
        let state = RateLimitState::new(RateLimitConfig {
            requests_per_window: 2,
            window: Duration::from_millis(50),
        });
        let key = token_key("Bearer abc");

        assert!(state.check(key).await.is_none());
        assert!(state.check(key).await.is_none());
        assert!(state.check(key).await.is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(state.check(key).await.is_none());
    }

    #[tokio::test]
    async fn distinct_tokens_have_distinct_budgets() {
        let state = RateLimitState::new(RateLimitConfig {
            requests_per_window: 1,
            window: Duration::from_secs(60),
        });
        assert!(state.check(token_key("Bearer a")).await.is_none());
        assert!(state.check(token_key("Bearer b")).await.is_none());
        assert!(state.check(token_key("Bearer a")).await.is_some());
    }
}
