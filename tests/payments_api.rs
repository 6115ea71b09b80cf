//! HTTP surface over in-memory stores.

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use common::*;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use studyhall_payments::api::PaymentsState;
use studyhall_payments::config::RateLimitConfig;
use studyhall_payments::health::HealthChecker;
use studyhall_payments::middleware::rate_limit::InMemoryRateLimiter;

fn app(h: &Harness) -> Router {
    let limiter = InMemoryRateLimiter::new(
        RateLimitConfig {
            max_attempts: 3,
            window_secs: 3600,
        },
        h.clock.clone(),
    );
    studyhall_payments::build_router(
        Arc::new(PaymentsState {
            service: h.service.clone(),
            rate_limiter: Arc::new(limiter),
        }),
        HealthChecker::new(h.service.clone()),
    )
}

fn initiate_body(client_txn_id: &str) -> Value {
    json!({
        "client_txn_id": client_txn_id,
        "amount_minor": 50000,
        "customer": {"name": "Asha Rao", "email": "asha@example.com", "mobile": "9876543210"},
        "flow": "pay_first",
        "slot": SLOT
    })
}

fn post_json(uri: &str, body: &Value, client_id: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-client-id", client_id)
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn initiate_returns_qr_data_and_request_id() {
    let h = Harness::new();
    let response = app(&h)
        .oneshot(post_json(
            "/api/payments/initiate",
            &initiate_body("SH-API-1"),
            "kiosk-1",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(response.headers().contains_key("x-request-id"));

    let body = json_body(response).await;
    assert_eq!(body["order"]["client_txn_id"], "SH-API-1");
    assert_eq!(body["order"]["status"], "pending");
    assert_eq!(body["view"]["stage"], "awaiting_payment");
    assert_eq!(body["view"]["qr_payload"], "upi://pay?pa=hall@upi&tr=SH-API-1");
    assert_eq!(body["view"]["amount_display"], "₹500.00");

    h.service.detach_all();
}

#[tokio::test]
async fn fourth_attempt_in_window_is_throttled() {
    let h = Harness::new();
    let app = app(&h);

    for n in 0..3 {
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/payments/initiate",
                &initiate_body(&format!("SH-RL-{}", n)),
                "kiosk-7",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let throttled = app
        .clone()
        .oneshot(post_json(
            "/api/payments/initiate",
            &initiate_body("SH-RL-3"),
            "kiosk-7",
        ))
        .await
        .unwrap();
    assert_eq!(throttled.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = json_body(throttled).await;
    assert_eq!(body["retryable"], true);
    assert!(body["request_id"].is_string());

    // the refused attempt never reached the gateway
    assert_eq!(h.gateway.created.lock().unwrap().len(), 3);
    h.service.detach_all();
}

#[tokio::test]
async fn unknown_order_is_not_found() {
    let h = Harness::new();
    let response = app(&h)
        .oneshot(
            Request::builder()
                .uri("/api/payments/SH-NOPE")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn callback_settles_order_and_cancel_is_then_refused() {
    let h = Harness::new();
    h.service.initiate(pay_first("SH-API-CB", SLOT)).await.unwrap();
    let app = app(&h);

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/payments/callback",
            &json!({"client_txn_id": "SH-API-CB", "provider_txn_id": "TXN9", "status": "success"}),
            "gateway",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["outcome"], "confirmed");
    assert_eq!(body["order"]["provider_txn_id"], "TXN9");

    let cancel = app
        .clone()
        .oneshot(post_json(
            "/api/payments/SH-API-CB/cancel",
            &json!({}),
            "kiosk-1",
        ))
        .await
        .unwrap();
    assert!(cancel.status().is_client_error());
}

#[tokio::test]
async fn health_reports_in_memory_components() {
    let h = Harness::new();
    let response = app(&h)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "Healthy");
    assert_eq!(body["checks"]["pollers"]["details"], "0 active");
}
