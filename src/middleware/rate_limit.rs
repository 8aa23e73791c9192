//! Per-client rate limiting.
//!
//! Fixed-window counting keyed by API key when one is presented, falling
//! back to the peer IP. Enough to keep a misbehaving poller from starving
//! the mutation path; tuning belongs to the deployment, not this module.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 300,
            window: Duration::from_secs(60),
        }
    }
}

struct WindowEntry {
    count: u32,
    window_start: Instant,
}

/// Shared limiter state; cheap to clone into the middleware layer.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Arc<Mutex<HashMap<String, WindowEntry>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Count one request against `client`; `Err` carries the retry delay.
    fn check(&self, client: &str) -> Result<(), Duration> {
        let mut windows = self.windows.lock();
        let now = Instant::now();

        let entry = windows.entry(client.to_string()).or_insert(WindowEntry {
            count: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) >= self.config.window {
            entry.count = 0;
            entry.window_start = now;
        }

        entry.count += 1;
        if entry.count > self.config.max_requests {
            let reset_at = entry.window_start + self.config.window;
            Err(reset_at.saturating_duration_since(now))
        } else {
            Ok(())
        }
    }

    /// Drop windows that have been idle for two full periods. Called from a
    /// background task so the map stays bounded.
    pub fn cleanup(&self) -> usize {
        let mut windows = self.windows.lock();
        let before = windows.len();
        let horizon = self.config.window * 2;
        let now = Instant::now();
        windows.retain(|_, e| now.duration_since(e.window_start) < horizon);
        before - windows.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.lock().len()
    }
}

pub async fn rate_limit_middleware(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(limiter): State<RateLimiter>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let client = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|k| format!("key:{k}"))
        .unwrap_or_else(|| format!("ip:{}", addr.ip()));

    match limiter.check(&client) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            warn!(
                client = %client,
                retry_after_secs = retry_after.as_secs(),
                "rate limit exceeded"
            );
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after.as_secs().max(1).to_string())],
                axum::Json(serde_json::json!({
                    "errorType": "rate_limited",
                    "errorMessage": "Too many requests",
                    "retryAfterSeconds": retry_after.as_secs().max(1),
                })),
            )
                .into_response()
        }
    }
}
