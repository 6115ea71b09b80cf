//! Redis connection pool
//!
//! Backs the shared booking rate limiter so attempt counts hold across
//! every instance of the service. When Redis is down the limiter falls
//! back to allowing requests; payments never depend on it.

pub mod error;

use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use redis::Client;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::CacheConfig;
pub use error::{CacheError, CacheResult};

/// Redis connection pool type alias
pub type RedisPool = Pool<RedisConnectionManager>;

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_LIFETIME: Duration = Duration::from_secs(300);
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Initialize Redis connection pool with fault tolerance
pub async fn init_cache_pool(config: &CacheConfig) -> CacheResult<RedisPool> {
    info!(
        max_connections = config.max_connections,
        "Initializing Redis pool"
    );

    let client = Client::open(config.redis_url.clone()).map_err(|e| {
        error!("Failed to create Redis client: {}", e);
        CacheError::ConnectionError(e.to_string())
    })?;

    let manager = RedisConnectionManager::new(client.get_connection_info().clone()).map_err(|e| {
        error!("Failed to create Redis connection manager: {}", e);
        CacheError::ConnectionError(e.to_string())
    })?;

    let pool = Pool::builder()
        .max_size(config.max_connections)
        .min_idle(1)
        .connection_timeout(CONNECTION_TIMEOUT)
        .max_lifetime(MAX_LIFETIME)
        .idle_timeout(IDLE_TIMEOUT)
        .test_on_check_out(false)
        .build(manager)
        .await
        .map_err(|e| {
            error!("Failed to build Redis connection pool: {}", e);
            CacheError::ConnectionError(e.to_string())
        })?;

    if let Err(e) = test_connection(&pool).await {
        warn!("Initial Redis connection test failed, continuing without it: {}", e);
    }

    info!("Redis pool initialized");
    Ok(pool)
}

async fn test_connection(pool: &RedisPool) -> CacheResult<()> {
    let mut conn = pool.get().await?;
    let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
    Ok(())
}

/// Health check for Redis connection pool
pub async fn health_check(pool: &RedisPool) -> CacheResult<()> {
    test_connection(pool).await
}

#[derive(Debug)]
pub struct CacheStats {
    pub connections: u32,
    pub idle_connections: u32,
}

pub fn get_cache_stats(pool: &RedisPool) -> CacheStats {
    let state = pool.state();
    CacheStats {
        connections: state.connections,
        idle_connections: state.idle_connections,
    }
}
