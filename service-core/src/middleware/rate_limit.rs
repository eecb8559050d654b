//! Coarse in-process rate limiting for the HTTP edge.
//!
//! This is the outer, per-IP guard applied at the router. Per-identifier
//! limits for sensitive actions (login, password reset) live in the service
//! layer, backed by a shared counter store.

use crate::error::AppError;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use governor::{
    clock::{Clock, DefaultClock},
    state::keyed::DashMapStateStore,
    Quota, RateLimiter,
};
use std::{net::SocketAddr, num::NonZeroU32, sync::Arc, time::Duration};

/// Rate limiter keyed by IP address.
pub type IpRateLimiter = Arc<RateLimiter<SocketAddr, DashMapStateStore<SocketAddr>, DefaultClock>>;

/// Create a keyed rate limiter (by IP).
pub fn create_ip_rate_limiter(attempts: u32, window_seconds: u64) -> IpRateLimiter {
    let attempts = attempts.max(1);
    let period = Duration::from_millis((window_seconds * 1000) / attempts as u64);
    let quota = Quota::with_period(period)
        .expect("Failed to create quota with valid period")
        .allow_burst(NonZeroU32::new(attempts).expect("attempts is guaranteed to be non-zero"));

    Arc::new(RateLimiter::dashmap(quota))
}

/// Middleware for IP-based rate limiting.
pub async fn ip_rate_limit_middleware(
    State(limiter): State<IpRateLimiter>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let forwarded_ip = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse::<std::net::IpAddr>().ok());

    let addr = if let Some(ip) = forwarded_ip {
        Some(SocketAddr::new(ip, 0))
    } else {
        request
            .extensions()
            .get::<axum::extract::ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0)
    };

    let Some(addr) = addr else {
        // No usable peer address (e.g. in-process test harness): let it pass,
        // the service-layer limiters still apply.
        return Ok(next.run(request).await);
    };

    match limiter.check_key(&addr) {
        Ok(_) => Ok(next.run(request).await),
        Err(negative) => {
            let wait_time = negative.wait_time_from(DefaultClock::default().now());
            Err(AppError::TooManyRequests(
                "Too many requests. Please try again later.".to_string(),
                Some(wait_time.as_secs()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_rate_limiter_enforces_burst() {
        let limiter = create_ip_rate_limiter(3, 60);
        let addr: SocketAddr = "10.0.0.1:0".parse().unwrap();

        assert!(limiter.check_key(&addr).is_ok());
        assert!(limiter.check_key(&addr).is_ok());
        assert!(limiter.check_key(&addr).is_ok());
        assert!(limiter.check_key(&addr).is_err());

        // A different key has its own budget.
        let other: SocketAddr = "10.0.0.2:0".parse().unwrap();
        assert!(limiter.check_key(&other).is_ok());
    }
}
