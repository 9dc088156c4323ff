//! Fixed-window request counter keyed by client address.
//!
//! Each key gets a window that starts on its first request. Requests past
//! `max_requests` inside the window are rejected until the window ends. Dead
//! windows are reset lazily on the next request and removed by a periodic
//! sweep; a late sweep only delays reclaiming memory.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use codedrop_core::protocol::ErrorResponse;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_REQUESTS: u32 = 20;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Bucket shared by requests whose origin cannot be determined.
pub const UNKNOWN_CLIENT: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            max_requests: DEFAULT_MAX_REQUESTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rate limit exceeded; retry after {retry_after_secs}s")]
pub struct RateLimitError {
    pub retry_after_secs: u64,
}

impl IntoResponse for RateLimitError {
    fn into_response(self) -> Response {
        (
            StatusCode::TOO_MANY_REQUESTS,
            [("Retry-After", self.retry_after_secs.to_string())],
            Json(ErrorResponse {
                error: "Too many requests. Please try again later.".to_owned(),
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    resets_at: Instant,
}

pub struct FixedWindowLimiter {
    config: RateLimitConfig,
    windows: DashMap<String, Window>,
}

impl FixedWindowLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    pub fn check(&self, key: &str) -> Result<(), RateLimitError> {
        self.check_at(key, Instant::now())
    }

    /// Counts one request for `key` at `now`.
    pub fn check_at(&self, key: &str, now: Instant) -> Result<(), RateLimitError> {
        let fresh = Window {
            count: 0,
            resets_at: now + self.config.window,
        };
        let mut window = match self.windows.entry(key.to_owned()) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(entry) => entry.insert(fresh),
        };
        if now >= window.resets_at {
            *window = fresh;
        }
        window.count = window.count.saturating_add(1);

        if window.count > self.config.max_requests {
            let remaining = window.resets_at.saturating_duration_since(now);
            return Err(RateLimitError {
                retry_after_secs: remaining.as_secs().max(1),
            });
        }
        Ok(())
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Removes every window that has ended by `now`. Returns how many were removed.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.windows.retain(|_, window| {
            let live = window.resets_at > now;
            if !live {
                removed += 1;
            }
            live
        });
        removed
    }

    #[must_use]
    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }

    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let removed = self.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, remaining = self.tracked_clients(), "rate limiter sweep finished");
                        }
                    }
                }
            }
        })
    }
}

/// Best-effort origin of a request: the first `X-Forwarded-For` hop, then
/// `X-Real-IP`, then the peer address.
pub(crate) fn client_address(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    forwarded
        .or_else(real_ip)
        .map(ToOwned::to_owned)
        .or_else(|| peer.map(|address| address.ip().to_string()))
}

/// Client address computed once by [`rate_limit_middleware`] for the handler behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ClientAddress(pub Option<String>);

pub async fn rate_limit_middleware(
    State(limiter): State<Arc<FixedWindowLimiter>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let address = client_address(req.headers(), peer);
    let key = address.as_deref().unwrap_or(UNKNOWN_CLIENT);

    if let Err(error) = limiter.check(key) {
        tracing::debug!(client = key, retry_after_secs = error.retry_after_secs, "rate limited");
        return error.into_response();
    }

    req.extensions_mut().insert(ClientAddress(address));
    next.run(req).await
}
