//! UPI payment reconciliation for study hall bookings.
//!
//! A payment order is created with the gateway, polled until it settles,
//! and its outcome is reconciled against the booking store so a paid order
//! yields exactly one confirmed booking, or a refund flag when the slot was
//! taken in the meantime.

pub mod api;
#[cfg(feature = "cache")]
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
pub mod workers;

use std::sync::Arc;

use axum::Router;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};

use crate::api::PaymentsState;
use crate::health::HealthChecker;
use crate::middleware::logging::{request_logging_middleware, UuidRequestId};

/// Full HTTP surface with request-id and logging layers.
pub fn build_router(payments: Arc<PaymentsState>, health: HealthChecker) -> Router {
    Router::new()
        .merge(api::router(payments))
        .merge(health::router(health))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(axum::middleware::from_fn(request_logging_middleware))
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}
