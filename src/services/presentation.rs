//! UI-facing rendering of reconciliation events
//!
//! Turns [`ReconciliationEvent`]s into [`PaymentView`]s: copy, tone, QR
//! source data and UPI app links. It never calls the gateway or the stores.

use crate::database::order_repository::{OrderStatus, PaymentOrder};
use crate::services::reconciliation::{ReconciliationEvent, ReconciliationStage};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Info,
    Progress,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeepLink {
    pub label: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentView {
    pub client_txn_id: String,
    pub stage: ReconciliationStage,
    pub headline: String,
    pub detail: String,
    pub tone: Tone,
    /// Data to encode in the QR code; only set while payment is awaited.
    pub qr_payload: Option<String>,
    pub deep_links: Vec<DeepLink>,
    pub amount_display: Option<String>,
    pub can_retry: bool,
    pub refund_required: bool,
    pub at: DateTime<Utc>,
}

/// `50000` paise as `₹500.00`.
pub fn format_rupees(amount_minor: i64) -> String {
    let sign = if amount_minor < 0 { "-" } else { "" };
    let abs = amount_minor.unsigned_abs();
    format!("{}₹{}.{:02}", sign, abs / 100, abs % 100)
}

/// Stage a persisted order is in, for clients that join late.
pub fn stage_for_order(order: &PaymentOrder) -> ReconciliationStage {
    match order.status {
        OrderStatus::Created => ReconciliationStage::OrderCreated,
        OrderStatus::Pending if order.last_checked_at.is_some() => ReconciliationStage::Polling,
        OrderStatus::Pending => ReconciliationStage::AwaitingPayment,
        OrderStatus::Completed if order.refund_required => {
            ReconciliationStage::ConflictRefundPending
        }
        OrderStatus::Completed => ReconciliationStage::Confirmed,
        OrderStatus::Failed => ReconciliationStage::Failed,
        OrderStatus::Timeout if order.refund_required => ReconciliationStage::NeedsSupport,
        OrderStatus::Timeout => ReconciliationStage::TimedOut,
        OrderStatus::Cancelled => ReconciliationStage::Cancelled,
    }
}

pub fn render(event: &ReconciliationEvent) -> PaymentView {
    build_view(
        &event.client_txn_id,
        event.stage,
        event.order.as_ref(),
        event.error.as_deref(),
        event.at,
    )
}

pub fn render_order(order: &PaymentOrder) -> PaymentView {
    build_view(
        &order.client_txn_id,
        stage_for_order(order),
        Some(order),
        order.failure_reason.as_deref(),
        order.updated_at,
    )
}

fn build_view(
    client_txn_id: &str,
    stage: ReconciliationStage,
    order: Option<&PaymentOrder>,
    error: Option<&str>,
    at: DateTime<Utc>,
) -> PaymentView {
    let amount = order.map(|o| format_rupees(o.amount_minor));
    let amount_text = amount.clone().unwrap_or_else(|| "your payment".to_string());
    let slot_text = order
        .and_then(|o| o.slot.as_ref())
        .map(|slot| slot.to_string())
        .unwrap_or_else(|| "your slot".to_string());

    let (headline, detail, tone, can_retry) = match stage {
        ReconciliationStage::OrderCreated => (
            "Preparing your payment".to_string(),
            format!("Creating a UPI order for {}.", amount_text),
            Tone::Info,
            false,
        ),
        ReconciliationStage::AwaitingPayment => (
            format!("Scan to pay {}", amount_text),
            "Scan the QR code with any UPI app, or open one of the apps below.".to_string(),
            Tone::Progress,
            false,
        ),
        ReconciliationStage::Polling => (
            "Waiting for payment confirmation".to_string(),
            "Finish the payment in your UPI app. This page updates on its own.".to_string(),
            Tone::Progress,
            false,
        ),
        ReconciliationStage::Confirmed => {
            let reference = order
                .and_then(|o| o.provider_txn_id.as_deref())
                .map(|id| format!(" (UPI ref {})", id))
                .unwrap_or_default();
            (
                "Booking confirmed".to_string(),
                format!("Payment received{}. {} is booked for you.", reference, slot_text),
                Tone::Success,
                false,
            )
        }
        ReconciliationStage::ConflictRefundPending => (
            "Payment received, but the slot is gone".to_string(),
            format!(
                "Your payment succeeded but {} was booked by someone else first. A refund of {} has been initiated.",
                slot_text, amount_text
            ),
            Tone::Warning,
            false,
        ),
        ReconciliationStage::Failed => (
            "Payment not completed".to_string(),
            match error {
                Some(reason) => format!(
                    "Your payment may not have succeeded ({}). No booking was made, so you can try again.",
                    reason
                ),
                None => "Your payment may not have succeeded. No booking was made, so you can try again."
                    .to_string(),
            },
            Tone::Error,
            true,
        ),
        ReconciliationStage::TimedOut => (
            "We couldn't confirm your payment in time".to_string(),
            "If money left your account, do not pay again. We will verify the payment with the gateway and update your booking."
                .to_string(),
            Tone::Warning,
            false,
        ),
        ReconciliationStage::Cancelled => (
            "Payment cancelled".to_string(),
            "You cancelled this payment. No booking was made.".to_string(),
            Tone::Info,
            true,
        ),
        ReconciliationStage::NeedsSupport => (
            "We couldn't record your payment".to_string(),
            format!(
                "Please contact support with reference {}. Do not pay again until we confirm what happened.",
                client_txn_id
            ),
            Tone::Error,
            false,
        ),
    };

    let awaiting = matches!(
        stage,
        ReconciliationStage::AwaitingPayment | ReconciliationStage::Polling
    );
    let (qr_payload, deep_links) = match order {
        Some(order) if awaiting => (
            order
                .upi_intent
                .primary()
                .map(str::to_string)
                .or_else(|| order.payment_url.clone()),
            order
                .upi_intent
                .labelled()
                .into_iter()
                .map(|(label, url)| DeepLink {
                    label: label.to_string(),
                    url,
                })
                .collect(),
        ),
        _ => (None, Vec::new()),
    };

    PaymentView {
        client_txn_id: client_txn_id.to_string(),
        stage,
        headline,
        detail,
        tone,
        qr_payload,
        deep_links,
        amount_display: amount,
        can_retry,
        refund_required: order.map(|o| o.refund_required).unwrap_or(false),
        at,
    }
}

/// Views for one order, ending after its first terminal stage.
pub fn follow(
    receiver: broadcast::Receiver<ReconciliationEvent>,
    client_txn_id: impl Into<String>,
) -> impl Stream<Item = PaymentView> + Send + 'static {
    let client_txn_id = client_txn_id.into();
    stream::unfold((receiver, false), move |(mut receiver, finished)| {
        let client_txn_id = client_txn_id.clone();
        async move {
            if finished {
                return None;
            }
            loop {
                match receiver.recv().await {
                    Ok(event) if event.client_txn_id == client_txn_id => {
                        let done = event.stage.is_terminal();
                        return Some((render(&event), (receiver, done)));
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(client_txn_id = %client_txn_id, skipped, "payment view stream lagged");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::order_repository::BookingRef;
    use crate::payments::{CustomerInfo, UpiIntentLinks};
    use futures::StreamExt;

    fn order(status: OrderStatus) -> PaymentOrder {
        let now = Utc::now();
        PaymentOrder {
            client_txn_id: "txn_1".to_string(),
            order_id: Some("4171".to_string()),
            provider_txn_id: None,
            amount_minor: 50_000,
            status,
            booking_ref: BookingRef::placeholder(),
            slot: Some("hallA|2024-06-17|09:00-17:00".parse().expect("valid slot")),
            customer: CustomerInfo {
                name: "Asha".to_string(),
                email: "asha@example.com".to_string(),
                mobile: "9876543210".to_string(),
            },
            txn_date: "17-06-2024".to_string(),
            payment_url: Some("https://pay.example.com/4171".to_string()),
            upi_intent: UpiIntentLinks {
                bhim_link: Some("upi://pay?pa=hall@upi&am=500.00".to_string()),
                gpay_link: Some("tez://upi/pay?pa=hall@upi&am=500.00".to_string()),
                ..Default::default()
            },
            refund_required: false,
            failure_reason: None,
            gateway_raw: None,
            created_at: now,
            updated_at: now,
            last_checked_at: None,
        }
    }

    fn event(stage: ReconciliationStage, order: PaymentOrder) -> ReconciliationEvent {
        ReconciliationEvent {
            client_txn_id: order.client_txn_id.clone(),
            stage,
            order: Some(order),
            error: None,
            at: Utc::now(),
        }
    }

    #[test]
    fn awaiting_payment_shows_qr_and_app_links() {
        let view = render(&event(ReconciliationStage::AwaitingPayment, order(OrderStatus::Pending)));
        assert_eq!(view.qr_payload.as_deref(), Some("upi://pay?pa=hall@upi&am=500.00"));
        assert_eq!(view.deep_links.len(), 2);
        assert_eq!(view.amount_display.as_deref(), Some("₹500.00"));
        assert_eq!(view.headline, "Scan to pay ₹500.00");
    }

    #[test]
    fn terminal_views_hide_the_qr_code() {
        let view = render(&event(ReconciliationStage::Confirmed, order(OrderStatus::Completed)));
        assert!(view.qr_payload.is_none());
        assert!(view.deep_links.is_empty());
        assert_eq!(view.tone, Tone::Success);
    }

    #[test]
    fn failure_timeout_and_conflict_read_differently() {
        let failed = render(&event(ReconciliationStage::Failed, order(OrderStatus::Failed)));
        let timed_out = render(&event(ReconciliationStage::TimedOut, order(OrderStatus::Timeout)));
        let mut refunded_order = order(OrderStatus::Completed);
        refunded_order.refund_required = true;
        let conflict = render(&event(ReconciliationStage::ConflictRefundPending, refunded_order));

        assert!(failed.detail.contains("may not have succeeded"));
        assert!(timed_out.headline.contains("couldn't confirm"));
        assert!(conflict.detail.contains("refund"));
        assert!(conflict.refund_required);

        assert!(failed.can_retry);
        assert!(!timed_out.can_retry);
        assert!(!conflict.can_retry);
        assert_ne!(failed.headline, timed_out.headline);
        assert_ne!(timed_out.headline, conflict.headline);
    }

    #[test]
    fn persisted_orders_map_back_to_stages() {
        let mut refunded = order(OrderStatus::Completed);
        refunded.refund_required = true;
        assert_eq!(stage_for_order(&refunded), ReconciliationStage::ConflictRefundPending);
        assert_eq!(
            stage_for_order(&order(OrderStatus::Timeout)),
            ReconciliationStage::TimedOut
        );
        let mut paid_late = order(OrderStatus::Timeout);
        paid_late.refund_required = true;
        assert_eq!(stage_for_order(&paid_late), ReconciliationStage::NeedsSupport);
        assert_eq!(
            render_order(&order(OrderStatus::Pending)).stage,
            ReconciliationStage::AwaitingPayment
        );
    }

    #[test]
    fn formats_paise_as_rupees() {
        assert_eq!(format_rupees(50_000), "₹500.00");
        assert_eq!(format_rupees(105), "₹1.05");
    }

    #[tokio::test]
    async fn follow_filters_by_order_and_ends_on_terminal_stage() {
        let (tx, rx) = broadcast::channel(16);
        let views = follow(rx, "txn_1");

        let mut other = order(OrderStatus::Pending);
        other.client_txn_id = "txn_2".to_string();
        tx.send(event(ReconciliationStage::AwaitingPayment, order(OrderStatus::Pending)))
            .expect("send");
        tx.send(event(ReconciliationStage::AwaitingPayment, other))
            .expect("send");
        tx.send(event(ReconciliationStage::Polling, order(OrderStatus::Pending)))
            .expect("send");
        tx.send(event(ReconciliationStage::Confirmed, order(OrderStatus::Completed)))
            .expect("send");
        tx.send(event(ReconciliationStage::Polling, order(OrderStatus::Pending)))
            .expect("send");

        let stages: Vec<ReconciliationStage> = views.map(|view| view.stage).collect().await;
        assert_eq!(
            stages,
            vec![
                ReconciliationStage::AwaitingPayment,
                ReconciliationStage::Polling,
                ReconciliationStage::Confirmed,
            ]
        );
    }
}
