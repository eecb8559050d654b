//! Windowed rate limiting over a shared counter store.
//!
//! The counters live in Redis so every request-handling worker sees the same
//! state; in-process memory is never authoritative. Each sensitive action
//! gets its own keyspace prefix and thresholds.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::{aio::ConnectionManager, Client};
use std::time::{Duration, Instant};

use crate::config::RedisConfig;

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after_seconds: u64,
}

/// Shared counter store with per-key expiring windows.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter for `key`, starting a window of
    /// `window_seconds` on first increment. Returns the new count and the
    /// seconds remaining until the window resets.
    async fn incr_window(&self, key: &str, window_seconds: u64)
        -> Result<(u64, u64), anyhow::Error>;

    async fn health_check(&self) -> Result<(), anyhow::Error>;
}

#[derive(Clone)]
pub struct RedisCounters {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisCounters {
    pub async fn new(config: &RedisConfig) -> Result<Self, anyhow::Error> {
        tracing::info!(url = %config.url, "Connecting to Redis");
        let client = Client::open(config.url.clone())?;

        // ConnectionManager reconnects automatically.
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounters {
    async fn incr_window(
        &self,
        key: &str,
        window_seconds: u64,
    ) -> Result<(u64, u64), anyhow::Error> {
        let mut conn = self.manager.clone();

        let count: u64 = redis::cmd("INCR")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to increment counter: {}", e))?;

        if count == 1 {
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(window_seconds)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to set counter expiry: {}", e))?;
        }

        let ttl: i64 = redis::cmd("TTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read counter TTL: {}", e))?;

        Ok((count, ttl.max(0) as u64))
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Redis health check failed: {}", e))
    }
}

/// In-memory counter store for tests.
#[derive(Default)]
pub struct MemoryCounters {
    windows: DashMap<String, (u64, Instant)>,
}

impl MemoryCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounters {
    async fn incr_window(
        &self,
        key: &str,
        window_seconds: u64,
    ) -> Result<(u64, u64), anyhow::Error> {
        let now = Instant::now();
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert((0, now + Duration::from_secs(window_seconds)));

        let (count, reset_at) = *entry;
        if reset_at <= now {
            *entry = (1, now + Duration::from_secs(window_seconds));
            return Ok((1, window_seconds));
        }

        *entry = (count + 1, reset_at);
        Ok((count + 1, reset_at.duration_since(now).as_secs().max(1)))
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

/// Counter store that always errors; used to test fail-closed behavior.
pub struct FailingCounters;

#[async_trait]
impl CounterStore for FailingCounters {
    async fn incr_window(&self, _key: &str, _window: u64) -> Result<(u64, u64), anyhow::Error> {
        Err(anyhow::anyhow!("counter store unavailable"))
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        Err(anyhow::anyhow!("counter store unavailable"))
    }
}

/// One limiter configuration: a keyspace, a threshold, and a window.
#[derive(Clone)]
pub struct WindowLimiter {
    store: std::sync::Arc<dyn CounterStore>,
    prefix: &'static str,
    threshold: u32,
    window_seconds: u64,
}

impl WindowLimiter {
    pub fn new(
        store: std::sync::Arc<dyn CounterStore>,
        prefix: &'static str,
        threshold: u32,
        window_seconds: u64,
    ) -> Self {
        Self {
            store,
            prefix,
            threshold: threshold.max(1),
            window_seconds: window_seconds.max(1),
        }
    }

    /// Count this call against `identifier` and decide.
    ///
    /// Fail-closed: if the counter store is unreachable the request is
    /// denied. An unavailable limiter must not become an unlimited one.
    pub async fn check(&self, identifier: &str) -> RateLimitDecision {
        let key = format!("{}{}", self.prefix, identifier);

        match self.store.incr_window(&key, self.window_seconds).await {
            Ok((count, reset_in)) => {
                let allowed = count <= u64::from(self.threshold);
                RateLimitDecision {
                    allowed,
                    remaining: u64::from(self.threshold).saturating_sub(count) as u32,
                    retry_after_seconds: if allowed { 0 } else { reset_in.max(1) },
                }
            }
            Err(e) => {
                tracing::error!(error = %e, identifier, "Counter store error; denying request");
                RateLimitDecision {
                    allowed: false,
                    remaining: 0,
                    retry_after_seconds: self.window_seconds,
                }
            }
        }
    }
}
