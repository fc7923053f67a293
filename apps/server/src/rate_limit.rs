use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use dashmap::DashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::models::ErrorBody;

type TierMap = DashMap<Tier, (RateLimitConfig, DashMap<IpAddr, Vec<Instant>>)>;

/// Route groups that are limited independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Read-only public endpoints (plans, availability).
    Public,
    /// Reservation creation.
    Booking,
    /// Reservation check / cancel by number + email.
    Lookup,
    /// Admin login.
    Login,
    /// Authenticated admin endpoints.
    Admin,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimitConfig {
    pub const fn per(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }
}

/// In-memory per-IP sliding-window limiter, one window per [`Tier`].
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    tiers: Arc<TierMap>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The production tier table.
    pub fn with_defaults() -> Self {
        let limiter = Self::new();
        limiter.add_tier(Tier::Public, RateLimitConfig::per(60, Duration::from_secs(60)));
        limiter.add_tier(Tier::Booking, RateLimitConfig::per(5, Duration::from_secs(300)));
        limiter.add_tier(Tier::Lookup, RateLimitConfig::per(20, Duration::from_secs(60)));
        limiter.add_tier(Tier::Login, RateLimitConfig::per(10, Duration::from_secs(900)));
        limiter.add_tier(Tier::Admin, RateLimitConfig::per(120, Duration::from_secs(60)));
        limiter
    }

    pub fn add_tier(&self, tier: Tier, config: RateLimitConfig) {
        self.tiers.insert(tier, (config, DashMap::new()));
    }

    /// `Err(retry_after_secs)` when `ip` has used up `tier`'s window.
    /// Tiers that were never registered are unlimited.
    pub fn check(&self, tier: Tier, ip: IpAddr) -> Result<(), u64> {
        let Some(tier_entry) = self.tiers.get(&tier) else {
            return Ok(());
        };
        let (config, ip_map) = tier_entry.value();
        let now = Instant::now();

        let mut entry = ip_map.entry(ip).or_default();
        entry.retain(|t| now.duration_since(*t) < config.window);

        if entry.len() >= config.max_requests as usize {
            let oldest = entry[0];
            let retry_after = (oldest + config.window)
                .saturating_duration_since(now)
                .as_secs()
                .max(1);
            return Err(retry_after);
        }

        entry.push(now);
        Ok(())
    }

    /// Drops IPs idle for more than twice their tier's window.
    pub fn cleanup(&self) {
        let now = Instant::now();
        for tier_entry in self.tiers.iter() {
            let (config, ip_map) = tier_entry.value();
            let cutoff = config.window * 2;
            ip_map.retain(|_ip, timestamps| {
                timestamps.retain(|t| now.duration_since(*t) < cutoff);
                !timestamps.is_empty()
            });
        }
    }

    /// Middleware state for one route group.
    pub fn layer_state(&self, tier: Tier) -> (RateLimiter, Tier) {
        (self.clone(), tier)
    }
}

/// Client IP from `X-Forwarded-For` (first hop) or the socket address.
pub fn extract_client_ip(req: &Request) -> IpAddr {
    if let Some(first) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
    {
        if let Ok(ip) = first.trim().parse::<IpAddr>() {
            return ip;
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn too_many_requests(retry_after: u64) -> Response {
    let body = ErrorBody {
        success: false,
        error: "RATE_LIMITED",
        message: format!("Too many requests. Try again in {} seconds", retry_after),
    };
    (
        StatusCode::TOO_MANY_REQUESTS,
        [("Retry-After", retry_after.to_string())],
        Json(body),
    )
        .into_response()
}

/// Use with `from_fn_with_state(limiter.layer_state(tier), limit)`.
pub async fn limit(
    State((limiter, tier)): State<(RateLimiter, Tier)>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    let ip = extract_client_ip(&req);
    limiter.check(tier, ip).map_err(|retry_after| {
        tracing::warn!("rate limit hit: {:?} from {}", tier, ip);
        too_many_requests(retry_after)
    })?;
    Ok(next.run(req).await)
}
