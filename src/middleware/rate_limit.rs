//! Booking attempt throttling
//!
//! Fixed-window counters keyed by a client identifier. The limiter is an
//! injected collaborator: handlers consult it before a payment is
//! initiated, and the reconciliation core never sees it.

use crate::config::RateLimitConfig;
use crate::error::{AppError, AppErrorKind, ExternalError};
use crate::services::clock::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Seconds until the current window resets; set when refused.
    pub retry_after_secs: Option<u64>,
}

impl RateDecision {
    pub fn allow(remaining: u32) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after_secs: None,
        }
    }

    pub fn deny(retry_after_secs: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            retry_after_secs: Some(retry_after_secs),
        }
    }

    /// `Err` with a 429 when the attempt was refused.
    pub fn into_result(self, service: &str) -> Result<Self, AppError> {
        if self.allowed {
            return Ok(self);
        }
        Err(AppError::new(AppErrorKind::External(ExternalError::RateLimit {
            service: service.to_string(),
            retry_after: self.retry_after_secs,
        })))
    }
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Counts one attempt for `identifier` and says whether it may proceed.
    async fn check(&self, identifier: &str) -> RateDecision;
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: DateTime<Utc>,
    count: u32,
}

/// Process-local limiter. Windows start at the first attempt.
pub struct InMemoryRateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, Window>>,
}

impl InMemoryRateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn window_length(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.window_secs as i64)
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn check(&self, identifier: &str) -> RateDecision {
        let now = self.clock.now();
        let length = self.window_length();
        let mut windows = self.windows.lock().await;

        windows.retain(|_, window| now - window.started_at < length);

        let window = windows.entry(identifier.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });

        if window.count >= self.config.max_attempts {
            let retry_after = (window.started_at + length - now).num_seconds().max(1) as u64;
            debug!(identifier = %identifier, retry_after, "booking attempt throttled");
            return RateDecision::deny(retry_after);
        }

        window.count += 1;
        RateDecision::allow(self.config.max_attempts - window.count)
    }
}

#[cfg(feature = "cache")]
pub use redis_limiter::RedisRateLimiter;

#[cfg(feature = "cache")]
mod redis_limiter {
    use super::*;
    use crate::cache::{CacheResult, RedisPool};
    use tracing::warn;

    /// Shared limiter on Redis `INCR` + `EXPIRE`. Fails open when Redis is
    /// unreachable.
    pub struct RedisRateLimiter {
        pool: RedisPool,
        config: RateLimitConfig,
    }

    impl RedisRateLimiter {
        pub fn new(pool: RedisPool, config: RateLimitConfig) -> Self {
            Self { pool, config }
        }

        fn key(identifier: &str) -> String {
            format!("studyhall:booking_attempts:{}", identifier)
        }

        async fn count_attempt(&self, identifier: &str) -> CacheResult<(u32, i64)> {
            let key = Self::key(identifier);
            let mut conn = self.pool.get().await?;

            let count: u32 = redis::cmd("INCR").arg(&key).query_async(&mut *conn).await?;
            if count == 1 {
                let _: () = redis::cmd("EXPIRE")
                    .arg(&key)
                    .arg(self.config.window_secs)
                    .query_async(&mut *conn)
                    .await?;
            }
            let ttl: i64 = redis::cmd("TTL").arg(&key).query_async(&mut *conn).await?;
            Ok((count, ttl))
        }
    }

    #[async_trait]
    impl RateLimiter for RedisRateLimiter {
        async fn check(&self, identifier: &str) -> RateDecision {
            match self.count_attempt(identifier).await {
                Ok((count, _)) if count <= self.config.max_attempts => {
                    RateDecision::allow(self.config.max_attempts - count)
                }
                Ok((_, ttl)) => {
                    let retry_after = if ttl > 0 { ttl as u64 } else { self.config.window_secs };
                    debug!(identifier = %identifier, retry_after, "booking attempt throttled");
                    RateDecision::deny(retry_after)
                }
                Err(e) => {
                    warn!(identifier = %identifier, error = %e, "rate limiter unavailable, allowing attempt");
                    RateDecision::allow(self.config.max_attempts)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::ManualClock;
    use std::time::Duration;

    fn limiter(clock: Arc<ManualClock>) -> InMemoryRateLimiter {
        InMemoryRateLimiter::new(
            RateLimitConfig {
                max_attempts: 3,
                window_secs: 300,
            },
            clock,
        )
    }

    #[tokio::test]
    async fn allows_up_to_the_limit_then_refuses() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter = limiter(clock.clone());

        assert_eq!(limiter.check("9876543210").await.remaining, 2);
        assert_eq!(limiter.check("9876543210").await.remaining, 1);
        assert_eq!(limiter.check("9876543210").await.remaining, 0);

        clock.advance(Duration::from_secs(60));
        let refused = limiter.check("9876543210").await;
        assert!(!refused.allowed);
        assert_eq!(refused.retry_after_secs, Some(240));
        assert_eq!(refused.into_result("booking").unwrap_err().status_code(), 429);
    }

    #[tokio::test]
    async fn identifiers_are_counted_separately_and_windows_expire() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter = limiter(clock.clone());

        for _ in 0..3 {
            assert!(limiter.check("client-a").await.allowed);
        }
        assert!(!limiter.check("client-a").await.allowed);
        assert!(limiter.check("client-b").await.allowed);

        clock.advance(Duration::from_secs(300));
        assert!(limiter.check("client-a").await.allowed);
    }
}
