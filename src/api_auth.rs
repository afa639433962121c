//! API-key check and per-client rate limit for the `/api` routes.
//!
//! A request carrying `X-API-Key` must name an enabled key, or it is
//! rejected with 401 whether or not keys are required. Clients are counted
//! by key name when they have one, otherwise by address (first
//! `X-Forwarded-For` hop, then the peer address). Each client gets a fixed
//! one-minute window.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::{ApiConfig, ApiKeyConfig};
use crate::server::AppError;

pub const API_KEY_HEADER: &str = "x-api-key";

const WINDOW: Duration = Duration::from_secs(60);

/// Windows are pruned once this many clients are tracked.
const PRUNE_AT: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    started_at: Instant,
    count: u32,
}

/// Result of counting one request against its client's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the window resets.
    pub reset_after: u64,
}

#[derive(Clone)]
pub struct ClientRateLimiter {
    state: Arc<Mutex<HashMap<String, RateWindow>>>,
    window: Duration,
}

impl ClientRateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(HashMap::new())),
            window,
        }
    }

    pub async fn check(&self, client: &str, limit: u32) -> Quota {
        let now = Instant::now();
        let mut guard = self.state.lock().await;
        if guard.len() >= PRUNE_AT {
            let window = self.window;
            guard.retain(|_, w| now.duration_since(w.started_at) < window);
        }
        let entry = guard.entry(client.to_string()).or_insert(RateWindow {
            started_at: now,
            count: 0,
        });

        if now.duration_since(entry.started_at) >= self.window {
            entry.started_at = now;
            entry.count = 0;
        }
        let reset_after = self
            .window
            .saturating_sub(now.duration_since(entry.started_at))
            .as_secs()
            .max(1);

        if entry.count >= limit {
            return Quota {
                allowed: false,
                limit,
                remaining: 0,
                reset_after,
            };
        }
        entry.count += 1;
        Quota {
            allowed: true,
            limit,
            remaining: limit - entry.count,
            reset_after,
        }
    }
}

/// Key registry plus limiter, shared by every request through router state.
#[derive(Clone)]
pub struct ApiGuard {
    keys: Arc<HashMap<String, ApiKeyConfig>>,
    require_key: bool,
    rate_limiting: bool,
    anonymous_limit: u32,
    limiter: ClientRateLimiter,
}

/// Who a request was counted as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Client {
    Key { name: String, limit: u32 },
    Address(String),
}

impl Client {
    fn id(&self) -> String {
        match self {
            Client::Key { name, .. } => format!("api_key:{}", name),
            Client::Address(addr) => format!("ip:{}", addr),
        }
    }
}

impl ApiGuard {
    pub fn from_config(config: &ApiConfig) -> Self {
        let keys = config
            .keys
            .iter()
            .map(|k| (k.key.clone(), k.clone()))
            .collect();
        Self {
            keys: Arc::new(keys),
            require_key: config.require_key,
            rate_limiting: config.rate_limiting,
            anonymous_limit: config.anonymous_rate_limit,
            limiter: ClientRateLimiter::new(WINDOW),
        }
    }

    /// Resolve the caller, or reject a missing or unusable key.
    pub fn identify(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Result<Client, AppError> {
        match headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
            Some(presented) => match self.keys.get(presented) {
                Some(key) if key.enabled => Ok(Client::Key {
                    name: key.name.clone(),
                    limit: key.rate_limit,
                }),
                _ => Err(AppError::new(
                    StatusCode::UNAUTHORIZED,
                    "invalid_api_key",
                    "the provided API key is invalid or disabled",
                )),
            },
            None if self.require_key => Err(AppError::new(
                StatusCode::UNAUTHORIZED,
                "api_key_required",
                "include an X-API-Key header with a valid API key",
            )),
            None => Ok(Client::Address(client_address(headers, peer))),
        }
    }

    fn limit_for(&self, client: &Client) -> u32 {
        match client {
            Client::Key { limit, .. } => *limit,
            Client::Address(_) => self.anonymous_limit,
        }
    }
}

fn client_address(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| peer.map(|p| p.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn set_quota_headers(headers: &mut HeaderMap, quota: &Quota) {
    let reset_at = unix_now() + quota.reset_after;
    for (name, value) in [
        ("x-ratelimit-limit", quota.limit as u64),
        ("x-ratelimit-remaining", quota.remaining as u64),
        ("x-ratelimit-reset", reset_at),
    ] {
        headers.insert(name, HeaderValue::from(value));
    }
}

/// Route middleware for the `/api` routes.
pub async fn require_api_access(
    State(guard): State<ApiGuard>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = match guard.identify(request.headers(), peer) {
        Ok(client) => client,
        Err(e) => return e.into_response(),
    };
    if !guard.rate_limiting {
        return next.run(request).await;
    }

    let limit = guard.limit_for(&client);
    let quota = guard.limiter.check(&client.id(), limit).await;
    if !quota.allowed {
        warn!(
            client = %client.id(),
            limit,
            retry_after_secs = quota.reset_after,
            "api rate limit exceeded"
        );
        let mut response = AppError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            format!("at most {} requests per minute are allowed", limit),
        )
        .into_response();
        set_quota_headers(response.headers_mut(), &quota);
        response.headers_mut().insert(
            axum::http::header::RETRY_AFTER,
            HeaderValue::from(quota.reset_after),
        );
        return response;
    }

    let mut response = next.run(request).await;
    set_quota_headers(response.headers_mut(), &quota);
    response
}
