//! Health check module
//! Reports the state of the order store, the rate limiter cache and the
//! live pollers

use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, info};

use crate::services::reconciliation::ReconciliationService;

type ProbeError = Box<dyn std::error::Error + Send + Sync>;

/// Health status response
#[derive(Debug, Serialize, Clone)]
pub struct HealthStatus {
    pub status: HealthState,
    pub checks: HashMap<String, ComponentHealth>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Overall health state
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Individual component health status
#[derive(Debug, Serialize, Clone)]
pub struct ComponentHealth {
    pub status: ComponentState,
    pub response_time_ms: Option<u128>,
    pub details: Option<String>,
}

/// Component state
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum ComponentState {
    Up,
    Down,
    Warning,
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            status: HealthState::Healthy,
            checks: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, HealthState::Healthy)
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentHealth {
    pub fn up(response_time_ms: Option<u128>) -> Self {
        Self {
            status: ComponentState::Up,
            response_time_ms,
            details: None,
        }
    }

    pub fn down(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Down,
            response_time_ms: None,
            details,
        }
    }

    pub fn warning(response_time_ms: Option<u128>, details: Option<String>) -> Self {
        Self {
            status: ComponentState::Warning,
            response_time_ms,
            details,
        }
    }

    /// Keeps any failure message already recorded.
    fn with_details(mut self, details: impl Into<String>) -> Self {
        if self.details.is_none() {
            self.details = Some(details.into());
        }
        self
    }
}

/// Health checker for the application. Absent pools mean the service runs
/// on in-memory stores.
#[derive(Clone)]
pub struct HealthChecker {
    #[cfg(feature = "database")]
    db_pool: Option<sqlx::PgPool>,
    #[cfg(feature = "cache")]
    cache: Option<crate::cache::RedisPool>,
    service: Arc<ReconciliationService>,
}

impl HealthChecker {
    pub fn new(service: Arc<ReconciliationService>) -> Self {
        Self {
            #[cfg(feature = "database")]
            db_pool: None,
            #[cfg(feature = "cache")]
            cache: None,
            service,
        }
    }

    #[cfg(feature = "database")]
    pub fn with_database(mut self, pool: sqlx::PgPool) -> Self {
        self.db_pool = Some(pool);
        self
    }

    #[cfg(feature = "cache")]
    pub fn with_cache(mut self, pool: crate::cache::RedisPool) -> Self {
        self.cache = Some(pool);
        self
    }

    /// Perform comprehensive health check
    pub async fn check_health(&self) -> HealthStatus {
        let mut health_status = HealthStatus::new();
        let mut database_up = true;
        let mut cache_up = true;

        #[cfg(feature = "database")]
        let database = match &self.db_pool {
            Some(pool) => {
                let stats = crate::database::get_pool_stats(pool);
                probe("database", Duration::from_secs(5), check_database_health(pool))
                    .await
                    .with_details(format!("{} connections, {} idle", stats.size, stats.num_idle))
            }
            None => ComponentHealth::up(None).with_details("in-memory"),
        };
        #[cfg(not(feature = "database"))]
        let database = ComponentHealth::up(None).with_details("in-memory");
        database_up &= database.status != ComponentState::Down;
        health_status.checks.insert("database".to_string(), database);

        #[cfg(feature = "cache")]
        let cache = match &self.cache {
            Some(pool) => {
                let stats = crate::cache::get_cache_stats(pool);
                probe("cache", Duration::from_secs(5), check_cache_health(pool))
                    .await
                    .with_details(format!(
                        "{} connections, {} idle",
                        stats.connections, stats.idle_connections
                    ))
            }
            None => ComponentHealth::up(None).with_details("in-memory rate limiter"),
        };
        #[cfg(not(feature = "cache"))]
        let cache = ComponentHealth::up(None).with_details("in-memory rate limiter");
        cache_up &= cache.status != ComponentState::Down;
        health_status.checks.insert("cache".to_string(), cache);

        health_status.checks.insert(
            "pollers".to_string(),
            ComponentHealth::up(None)
                .with_details(format!("{} active", self.service.active_pollers())),
        );

        // The rate limiter fails open, so a lost cache only degrades service
        health_status.status = match (database_up, cache_up) {
            (false, _) => HealthState::Unhealthy,
            (true, false) => HealthState::Degraded,
            (true, true) => HealthState::Healthy,
        };

        health_status
    }
}

async fn probe<F>(component: &str, limit: Duration, check: F) -> ComponentHealth
where
    F: Future<Output = Result<u128, ProbeError>>,
{
    match timeout(limit, check).await {
        Ok(Ok(response_time)) => {
            info!("{} health check: OK ({}ms)", component, response_time);
            ComponentHealth::up(Some(response_time))
        }
        Ok(Err(e)) => {
            error!("{} health check failed: {}", component, e);
            ComponentHealth::down(Some(e.to_string()))
        }
        Err(_) => {
            error!("{} health check timed out", component);
            ComponentHealth::down(Some("Timeout".to_string()))
        }
    }
}

#[cfg(feature = "database")]
pub async fn check_database_health(pool: &sqlx::PgPool) -> Result<u128, ProbeError> {
    let start = Instant::now();
    crate::database::health_check(pool).await?;
    Ok(start.elapsed().as_millis())
}

#[cfg(feature = "cache")]
pub async fn check_cache_health(pool: &crate::cache::RedisPool) -> Result<u128, ProbeError> {
    let start = Instant::now();
    crate::cache::health_check(pool).await?;
    Ok(start.elapsed().as_millis())
}

/// GET /health
pub async fn health(
    axum::extract::State(checker): axum::extract::State<HealthChecker>,
) -> Result<axum::Json<HealthStatus>, (axum::http::StatusCode, String)> {
    let health_status = checker.check_health().await;

    // 503 only when orders cannot be stored
    if health_status.status == HealthState::Unhealthy {
        error!("Health check failed - service unhealthy");
        Err((
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            "Service Unavailable".to_string(),
        ))
    } else {
        Ok(axum::Json(health_status))
    }
}

/// GET /health/live
pub async fn liveness() -> &'static str {
    "OK"
}

pub fn router(checker: HealthChecker) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(health))
        .route("/health/live", get(liveness))
        .with_state(checker)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_status_creation() {
        let health_status = HealthStatus::new();
        assert!(matches!(health_status.status, HealthState::Healthy));
        assert!(health_status.checks.is_empty());
        assert!(health_status.timestamp <= chrono::Utc::now());
    }

    #[test]
    fn test_component_health_states() {
        let up_health = ComponentHealth::up(Some(100));
        assert!(matches!(up_health.status, ComponentState::Up));
        assert_eq!(up_health.response_time_ms, Some(100));

        let down_health = ComponentHealth::down(Some("Test error".to_string()));
        assert!(matches!(down_health.status, ComponentState::Down));
        assert_eq!(down_health.details, Some("Test error".to_string()));

        let warning_health = ComponentHealth::warning(Some(500), Some("Slow response".to_string()));
        assert!(matches!(warning_health.status, ComponentState::Warning));
        assert_eq!(warning_health.details, Some("Slow response".to_string()));
    }

    #[tokio::test]
    async fn probe_reports_timeouts_as_down() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<u128, ProbeError>(1)
        };
        let health = probe("database", Duration::from_millis(10), slow).await;
        assert_eq!(health.status, ComponentState::Down);
        assert_eq!(health.details.as_deref(), Some("Timeout"));
    }
}
