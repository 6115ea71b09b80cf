//! Payment endpoints
//!
//! Thin HTTP layer over [`ReconciliationService`]. Throttling happens here,
//! before a payment is initiated; the service itself is never rate limited.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::info;

use crate::database::order_repository::PaymentOrder;
use crate::error::AppError;
use crate::logging::mask_mobile;
use crate::middleware::error::get_request_id_from_headers;
use crate::middleware::rate_limit::RateLimiter;
use crate::payments::types::normalize_mobile;
use crate::services::presentation::{follow, render_order, PaymentView};
use crate::services::reconciliation::{
    InitiateRequest, ProviderCallback, ReconcileError, ReconciliationService,
};

pub struct PaymentsState {
    pub service: Arc<ReconciliationService>,
    pub rate_limiter: Arc<dyn RateLimiter>,
}

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub order: PaymentOrder,
    pub view: PaymentView,
}

impl OrderResponse {
    fn from_order(order: PaymentOrder) -> Self {
        let view = render_order(&order);
        Self { order, view }
    }
}

#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    pub outcome: &'static str,
    pub order: PaymentOrder,
}

pub fn router(state: Arc<PaymentsState>) -> Router {
    Router::new()
        .route("/api/payments/initiate", post(initiate_payment))
        .route("/api/payments/callback", post(provider_callback))
        .route("/api/payments/{client_txn_id}", get(get_payment))
        .route("/api/payments/{client_txn_id}/events", get(payment_events))
        .route("/api/payments/{client_txn_id}/cancel", post(cancel_payment))
        .with_state(state)
}

fn request_error(err: impl Into<AppError>, headers: &HeaderMap) -> AppError {
    let err = err.into();
    match get_request_id_from_headers(headers) {
        Some(request_id) => err.with_request_id(request_id),
        None => err,
    }
}

/// POST /api/payments/initiate
pub async fn initiate_payment(
    State(state): State<Arc<PaymentsState>>,
    headers: HeaderMap,
    Json(request): Json<InitiateRequest>,
) -> Result<impl IntoResponse, AppError> {
    let identifier = headers
        .get("x-client-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| normalize_mobile(&request.customer.mobile));

    state
        .rate_limiter
        .check(&identifier)
        .await
        .into_result("booking")
        .map_err(|e| request_error(e, &headers))?;

    info!(
        customer_mobile = %mask_mobile(&normalize_mobile(&request.customer.mobile)),
        amount_minor = request.amount_minor,
        "payment initiation requested"
    );

    let order = state
        .service
        .initiate_and_watch(request)
        .await
        .map_err(|e| request_error(e, &headers))?;

    Ok((StatusCode::CREATED, Json(OrderResponse::from_order(order))))
}

/// GET /api/payments/{client_txn_id}
pub async fn get_payment(
    State(state): State<Arc<PaymentsState>>,
    Path(client_txn_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<OrderResponse>, AppError> {
    let order = state
        .service
        .order(&client_txn_id)
        .await
        .map_err(|e| request_error(e, &headers))?;
    Ok(Json(OrderResponse::from_order(order)))
}

/// GET /api/payments/{client_txn_id}/events
///
/// Sends the current view first, then one view per reconciliation event
/// until the order settles.
pub async fn payment_events(
    State(state): State<Arc<PaymentsState>>,
    Path(client_txn_id): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    // Subscribe before reading the order so nothing between the two is lost
    let receiver = state.service.subscribe();
    let order = state
        .service
        .order(&client_txn_id)
        .await
        .map_err(|e| request_error(e, &headers))?;

    let current = render_order(&order);
    let updates = if order.status.is_terminal() {
        stream::empty().boxed()
    } else {
        follow(receiver, client_txn_id).boxed()
    };

    let views = stream::once(async move { current })
        .chain(updates)
        .map(|view| Ok::<_, Infallible>(view_event(&view)));

    Ok(Sse::new(views).keep_alive(KeepAlive::default()))
}

fn view_event(view: &PaymentView) -> Event {
    Event::default()
        .event(view.stage.as_str())
        .data(serde_json::to_string(view).unwrap_or_else(|_| "{}".to_string()))
}

/// POST /api/payments/{client_txn_id}/cancel
pub async fn cancel_payment(
    State(state): State<Arc<PaymentsState>>,
    Path(client_txn_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<OrderResponse>, AppError> {
    let order = state
        .service
        .cancel(&client_txn_id)
        .await
        .map_err(|e| request_error(e, &headers))?;
    Ok(Json(OrderResponse::from_order(order)))
}

/// POST /api/payments/callback
pub async fn provider_callback(
    State(state): State<Arc<PaymentsState>>,
    headers: HeaderMap,
    Json(callback): Json<ProviderCallback>,
) -> Result<Json<CallbackResponse>, AppError> {
    let outcome = state
        .service
        .handle_provider_callback(callback)
        .await
        .map_err(|e: ReconcileError| request_error(e, &headers))?;

    Ok(Json(CallbackResponse {
        outcome: outcome.kind(),
        order: outcome.order().clone(),
    }))
}
