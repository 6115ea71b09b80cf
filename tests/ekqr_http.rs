//! EKQR gateway against a local fake of its HTTP API.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use studyhall_payments::config::GatewayConfig;
use studyhall_payments::payments::utils::GatewayHttpClient;
use studyhall_payments::payments::{
    CreateOrderRequest, CustomerInfo, EkqrGateway, GatewayError, GatewayStatus, PaymentGateway,
    StatusCheck,
};

type Received = Arc<Mutex<Vec<Value>>>;

async fn create_order(State(received): State<Received>, Json(body): Json<Value>) -> Json<Value> {
    received.lock().unwrap().push(body.clone());
    Json(json!({
        "status": true,
        "msg": "Order Created",
        "data": {
            "order_id": 4411,
            "payment_url": "https://pay.example.com/4411",
            "upi_intent": {
                "bhim_link": "upi://pay?pa=hall@upi&am=500.00",
                "gpay_link": "tez://upi/pay?pa=hall@upi&am=500.00"
            }
        }
    }))
}

async fn check_order_status(
    State(received): State<Received>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    received.lock().unwrap().push(body.clone());
    match body["client_txn_id"].as_str() {
        Some("SH-PAID") => (
            StatusCode::OK,
            Json(json!({
                "status": true,
                "msg": "Transaction found",
                "data": {"status": "success", "upi_txn_id": "TXN1", "amount": 500}
            })),
        ),
        Some("SH-SCAN") => (
            StatusCode::OK,
            Json(json!({"status": true, "data": {"status": "scanning", "upi_txn_id": ""}})),
        ),
        Some("SH-DOWN") => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": false, "msg": "maintenance"})),
        ),
        _ => (
            StatusCode::OK,
            Json(json!({"status": false, "msg": "Record not found"})),
        ),
    }
}

async fn spawn_fake_gateway() -> (String, Received) {
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/create_order", post(create_order))
        .route("/check_order_status", post(check_order_status))
        .with_state(received.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), received)
}

fn gateway(base_url: String) -> EkqrGateway {
    let config = GatewayConfig {
        api_key: "test-key".to_string(),
        base_url,
        redirect_url: "https://studyhall.example.com/paid".to_string(),
        timeout_secs: 5,
        max_retries: 1,
    };
    let http = GatewayHttpClient::new(Duration::from_secs(5), 1)
        .unwrap()
        .with_backoff_base(Duration::from_millis(10));
    EkqrGateway::with_http_client(config, http)
}

#[tokio::test]
async fn create_order_sends_rupees_and_normalized_mobile() {
    let (base_url, received) = spawn_fake_gateway().await;
    let gateway = gateway(base_url);

    let created = gateway
        .create_order(CreateOrderRequest {
            client_txn_id: "SH-NEW".to_string(),
            amount_minor: 50_000,
            customer: CustomerInfo {
                name: "Asha Rao".to_string(),
                email: "asha@example.com".to_string(),
                mobile: "+91 98765-43210".to_string(),
            },
            product_info: "Study hall booking".to_string(),
            booking_reference: "tmp-1".to_string(),
            slot: Some("hallA|2024-06-17|09:00-17:00".to_string()),
        })
        .await
        .unwrap();

    assert_eq!(created.order_id, "4411");
    assert_eq!(
        created.upi_intent.primary(),
        Some("upi://pay?pa=hall@upi&am=500.00")
    );

    let body = received.lock().unwrap()[0].clone();
    assert_eq!(body["key"], "test-key");
    assert_eq!(body["amount"], "500.00");
    assert_eq!(body["customer_mobile"], "9876543210");
    assert_eq!(body["udf2"], "hallA|2024-06-17|09:00-17:00");
}

#[tokio::test]
async fn status_check_sends_gateway_date_format() {
    let (base_url, received) = spawn_fake_gateway().await;
    let gateway = gateway(base_url);

    let report = gateway
        .check_status(StatusCheck::new("SH-PAID", "2024-06-17").unwrap())
        .await
        .unwrap();
    assert_eq!(report.status, GatewayStatus::Completed);
    assert_eq!(report.provider_txn_id.as_deref(), Some("TXN1"));

    let scanning = gateway
        .check_status(StatusCheck::new("SH-SCAN", "17/06/2024").unwrap())
        .await
        .unwrap();
    assert_eq!(scanning.status, GatewayStatus::Pending);
    assert!(scanning.provider_txn_id.is_none());

    let bodies = received.lock().unwrap().clone();
    assert_eq!(bodies[0]["txn_date"], "17-06-2024");
    assert_eq!(bodies[1]["txn_date"], "17-06-2024");
}

#[tokio::test]
async fn envelope_rejection_and_outage_are_distinguished() {
    let (base_url, received) = spawn_fake_gateway().await;
    let gateway = gateway(base_url);

    let rejected = gateway
        .check_status(StatusCheck::new("SH-UNKNOWN", "17-06-2024").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(rejected, GatewayError::Rejected { .. }));
    assert_eq!(rejected.message(), "Record not found");

    let down = gateway
        .check_status(StatusCheck::new("SH-DOWN", "17-06-2024").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(down, GatewayError::Unavailable { status_code: Some(503), .. }));

    // one retry after the first 503
    let down_calls = received
        .lock()
        .unwrap()
        .iter()
        .filter(|b| b["client_txn_id"] == "SH-DOWN")
        .count();
    assert_eq!(down_calls, 2);
}

#[tokio::test]
async fn malformed_date_is_rejected_before_any_request() {
    let err = StatusCheck::new("SH-PAID", "June 17").unwrap_err();
    assert!(matches!(err, GatewayError::Rejected { .. }));
}
