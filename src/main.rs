use std::net::SocketAddr;
use std::sync::Arc;

use dotenv::dotenv;
use studyhall_payments::api::PaymentsState;
use studyhall_payments::cache::init_cache_pool;
use studyhall_payments::config::AppConfig;
use studyhall_payments::database::booking_repository::{BookingStore, PgBookingRepository};
use studyhall_payments::database::memory::{InMemoryBookingStore, InMemoryOrderStore};
use studyhall_payments::database::order_repository::{OrderStore, PgOrderRepository};
use studyhall_payments::database::{init_pool_from_config, run_migrations};
use studyhall_payments::health::HealthChecker;
use studyhall_payments::logging::init_tracing;
use studyhall_payments::middleware::rate_limit::{
    InMemoryRateLimiter, RateLimiter, RedisRateLimiter,
};
use studyhall_payments::payments::EkqrGateway;
use studyhall_payments::services::clock::{Clock, SystemClock};
use studyhall_payments::services::reconciliation::ReconciliationService;
use studyhall_payments::workers::OrderRecoveryWorker;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let config = AppConfig::from_env()?;
    init_tracing(&config.logging);
    config.validate()?;

    info!(
        skip_externals = config.skip_externals,
        poll_interval_secs = config.poller.interval.as_secs(),
        poll_max_duration_secs = config.poller.max_duration.as_secs(),
        "Starting study hall payment service"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let mut health_checker_pool = None;
    let (orders, bookings): (Arc<dyn OrderStore>, Arc<dyn BookingStore>) =
        match &config.database {
            Some(db_config) => {
                let pool = init_pool_from_config(db_config).await?;
                run_migrations(&pool).await?;
                health_checker_pool = Some(pool.clone());
                (
                    Arc::new(PgOrderRepository::new(pool.clone())),
                    Arc::new(PgBookingRepository::new(pool)),
                )
            }
            None => {
                warn!("SKIP_EXTERNALS is set, orders and bookings are kept in memory");
                (
                    Arc::new(InMemoryOrderStore::with_clock(clock.clone())),
                    Arc::new(InMemoryBookingStore::new()),
                )
            }
        };

    let mut health_checker_cache = None;
    let rate_limiter: Arc<dyn RateLimiter> = match &config.cache {
        Some(cache_config) => match init_cache_pool(cache_config).await {
            Ok(pool) => {
                health_checker_cache = Some(pool.clone());
                Arc::new(RedisRateLimiter::new(pool, config.rate_limit))
            }
            Err(e) => {
                warn!(error = %e, "Redis unavailable, using in-process rate limiter");
                Arc::new(InMemoryRateLimiter::new(config.rate_limit, clock.clone()))
            }
        },
        None => Arc::new(InMemoryRateLimiter::new(config.rate_limit, clock.clone())),
    };

    let gateway = Arc::new(EkqrGateway::new(config.gateway.clone())?);
    let service = ReconciliationService::new(
        gateway,
        orders.clone(),
        bookings,
        clock.clone(),
        config.poller,
        config.reconcile,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let recovery = OrderRecoveryWorker::new(
        service.clone(),
        orders,
        clock.clone(),
        config.recovery,
    );
    let recovery_handle = tokio::spawn(recovery.run(shutdown_rx));

    let mut health_checker = HealthChecker::new(service.clone());
    if let Some(pool) = health_checker_pool {
        health_checker = health_checker.with_database(pool);
    }
    if let Some(pool) = health_checker_cache {
        health_checker = health_checker.with_cache(pool);
    }

    let app = studyhall_payments::build_router(
        Arc::new(PaymentsState {
            service: service.clone(),
            rate_limiter,
        }),
        health_checker,
    );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to address {}: {}", addr, e);
        e
    })?;
    info!(address = %addr, "Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(shutdown_tx))
        .await?;

    // Persisted orders stay pending; the recovery sweep resumes them on restart
    service.detach_all();
    if let Err(e) = recovery_handle.await {
        warn!(error = %e, "order recovery worker did not stop cleanly");
    }

    info!("Server shut down");
    Ok(())
}
