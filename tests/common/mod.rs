//! Shared fixtures: a scripted gateway and an in-memory service harness.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

use studyhall_payments::config::{PollerConfig, ReconcileConfig};
use studyhall_payments::database::booking_repository::{
    Booking, BookingStatus, PaymentStatus, SlotKey,
};
use studyhall_payments::database::memory::{InMemoryBookingStore, InMemoryOrderStore};
use studyhall_payments::payments::types::{
    CreateOrderRequest, CreatedOrder, CustomerInfo, GatewayStatus, StatusCheck, StatusReport,
    UpiIntentLinks,
};
use studyhall_payments::payments::{GatewayError, GatewayResult, PaymentGateway};
use studyhall_payments::services::clock::ManualClock;
use studyhall_payments::services::reconciliation::{
    BookingFlow, InitiateRequest, ReconciliationEvent, ReconciliationService,
};
use uuid::Uuid;

pub const SLOT: &str = "hallA|2024-06-17|09:00-17:00";

/// Replays queued status reports; reports `pending` once the queue is empty.
#[derive(Default)]
pub struct ScriptedGateway {
    statuses: Mutex<VecDeque<GatewayResult<StatusReport>>>,
    create_failures: Mutex<VecDeque<GatewayError>>,
    pub status_calls: AtomicU32,
    pub created: Mutex<Vec<CreateOrderRequest>>,
}

impl ScriptedGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_status(&self, result: GatewayResult<StatusReport>) {
        self.statuses.lock().unwrap().push_back(result);
    }

    pub fn push_pending(&self, count: usize) {
        for _ in 0..count {
            self.push_status(Ok(report("pending", None)));
        }
    }

    pub fn fail_next_create(&self, error: GatewayError) {
        self.create_failures.lock().unwrap().push_back(error);
    }
}

pub fn report(status: &str, upi_txn_id: Option<&str>) -> StatusReport {
    StatusReport {
        status: GatewayStatus::from_provider(status),
        provider_status: status.to_string(),
        provider_txn_id: upi_txn_id.map(str::to_string),
        raw: json!({ "status": status, "upi_txn_id": upi_txn_id }),
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn create_order(&self, request: CreateOrderRequest) -> GatewayResult<CreatedOrder> {
        if let Some(error) = self.create_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.created.lock().unwrap().push(request.clone());
        Ok(CreatedOrder {
            order_id: format!("ord_{}", request.client_txn_id),
            client_txn_id: request.client_txn_id.clone(),
            payment_url: Some(format!("https://pay.example.com/{}", request.client_txn_id)),
            upi_intent: UpiIntentLinks {
                bhim_link: Some(format!("upi://pay?pa=hall@upi&tr={}", request.client_txn_id)),
                ..UpiIntentLinks::default()
            },
            raw: json!({ "status": true, "data": { "order_id": request.client_txn_id } }),
        })
    }

    async fn check_status(&self, _request: StatusCheck) -> GatewayResult<StatusReport> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(report("pending", None)))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub orders: Arc<InMemoryOrderStore>,
    pub bookings: Arc<InMemoryBookingStore>,
    pub gateway: Arc<ScriptedGateway>,
    pub service: Arc<ReconciliationService>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_max_duration(Duration::from_secs(60))
    }

    pub fn with_max_duration(max_duration: Duration) -> Self {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 16, 10, 0, 0).unwrap(),
        ));
        let orders = Arc::new(InMemoryOrderStore::with_clock(clock.clone()));
        let bookings = Arc::new(InMemoryBookingStore::new());
        let gateway = ScriptedGateway::new();
        let service = ReconciliationService::new(
            gateway.clone(),
            orders.clone(),
            bookings.clone(),
            clock.clone(),
            PollerConfig {
                interval: Duration::from_secs(5),
                max_duration,
            },
            ReconcileConfig {
                store_retries: 3,
                store_backoff: Duration::from_millis(50),
            },
        );
        Self {
            clock,
            orders,
            bookings,
            gateway,
            service,
        }
    }

    pub async fn seed_pending_booking(&self, slot: &str, amount_minor: i64) -> Booking {
        let now = Utc::now();
        let booking = Booking {
            id: Uuid::new_v4(),
            slot: slot.parse().unwrap(),
            status: BookingStatus::Pending,
            payment_status: PaymentStatus::Pending,
            amount_minor,
            client_txn_id: None,
            created_at: now,
            updated_at: now,
        };
        self.bookings.seed(booking.clone()).await;
        booking
    }

    pub async fn seed_confirmed_booking(&self, slot: &str) -> Booking {
        let mut booking = self.seed_pending_booking(slot, 50_000).await;
        booking.status = BookingStatus::Confirmed;
        booking.payment_status = PaymentStatus::Paid;
        self.bookings.seed(booking.clone()).await;
        booking
    }
}

pub fn customer() -> CustomerInfo {
    CustomerInfo {
        name: "Asha Rao".to_string(),
        email: "asha@example.com".to_string(),
        mobile: "+91 98765 43210".to_string(),
    }
}

pub fn pay_first(client_txn_id: &str, slot: &str) -> InitiateRequest {
    InitiateRequest {
        client_txn_id: Some(client_txn_id.to_string()),
        amount_minor: 50_000,
        customer: customer(),
        flow: BookingFlow::PayFirst {
            slot: slot.parse::<SlotKey>().unwrap(),
        },
    }
}

pub fn book_then_pay(client_txn_id: &str, booking: &Booking) -> InitiateRequest {
    InitiateRequest {
        client_txn_id: Some(client_txn_id.to_string()),
        amount_minor: booking.amount_minor,
        customer: customer(),
        flow: BookingFlow::BookThenPay {
            booking_id: booking.id,
        },
    }
}

/// Collects events for one order until a terminal stage arrives.
pub async fn events_until_terminal(
    receiver: &mut broadcast::Receiver<ReconciliationEvent>,
    client_txn_id: &str,
) -> Vec<ReconciliationEvent> {
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match receiver.recv().await {
                Ok(event) if event.client_txn_id == client_txn_id => {
                    let terminal = event.stage.is_terminal();
                    seen.push(event);
                    if terminal {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
    .await
    .expect("order did not settle");
    seen
}
