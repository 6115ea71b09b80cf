//! In-process stores used when `SKIP_EXTERNALS` is set and throughout the tests.
//!
//! Each store keeps its rows behind a single async mutex, which makes every
//! trait operation atomic in the same way a Postgres transaction is.

use crate::database::booking_repository::{
    previous_outcome, settle_action, Booking, BookingStatus, BookingStore, FinalizeOutcome,
    FinalizeRequest, NewBooking, PaymentStatus, SettleAction, SlotKey,
};
use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::database::order_repository::{
    is_scannable_provider_id, OrderAuditEntry, OrderStatus, OrderStore, PaymentOrder,
    StatusChange, TransitionOutcome, PROVIDER_ID_SCAN_LIMIT, PROVIDER_ID_SCAN_WINDOW_HOURS,
};
use crate::services::clock::{Clock, SystemClock};
use crate::services::conflict_checker::find_conflicts;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Counts down injected write failures; shared by both stores.
#[derive(Debug, Default)]
struct FailureInjector {
    remaining: AtomicU32,
}

impl FailureInjector {
    fn arm(&self, count: u32) {
        self.remaining.store(count, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), DatabaseError> {
        let took = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            return Err(DatabaseError::connection("injected write failure"));
        }
        Ok(())
    }
}

#[derive(Default)]
struct OrderState {
    orders: HashMap<String, PaymentOrder>,
    audit: Vec<OrderAuditEntry>,
}

impl OrderState {
    fn push_audit(
        &mut self,
        client_txn_id: &str,
        from: Option<OrderStatus>,
        to: OrderStatus,
        raw: Option<JsonValue>,
        at: DateTime<Utc>,
    ) {
        self.audit.push(OrderAuditEntry {
            client_txn_id: client_txn_id.to_string(),
            from_status: from,
            to_status: to,
            raw_payload: raw,
            recorded_at: at,
        });
    }
}

pub struct InMemoryOrderStore {
    state: Mutex<OrderState>,
    failures: FailureInjector,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryOrderStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// The clock bounds the provider-id fallback scan window.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(OrderState::default()),
            failures: FailureInjector::default(),
            clock,
        }
    }

    /// Makes the next `count` writes fail with a connection error.
    pub fn inject_write_failures(&self, count: u32) {
        self.failures.arm(count);
    }

    async fn pending_where(
        &self,
        limit: i64,
        keep: impl Fn(&PaymentOrder) -> bool,
    ) -> Vec<PaymentOrder> {
        let state = self.state.lock().await;
        let mut pending: Vec<PaymentOrder> = state
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Pending && keep(o))
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pending.truncate(limit.max(0) as usize);
        pending
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.orders.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn create(&self, order: &PaymentOrder) -> Result<PaymentOrder, DatabaseError> {
        self.failures.check()?;
        let mut state = self.state.lock().await;
        if state.orders.contains_key(&order.client_txn_id) {
            return Err(DatabaseError::new(DatabaseErrorKind::UniqueViolation {
                entity: "PaymentOrder".to_string(),
                message: format!("client_txn_id '{}' already exists", order.client_txn_id),
            }));
        }
        state
            .orders
            .insert(order.client_txn_id.clone(), order.clone());
        state.push_audit(
            &order.client_txn_id,
            None,
            order.status,
            order.gateway_raw.clone(),
            order.updated_at,
        );
        Ok(order.clone())
    }

    async fn save(&self, order: &PaymentOrder) -> Result<PaymentOrder, DatabaseError> {
        self.failures.check()?;
        let mut state = self.state.lock().await;
        let previous = state.orders.get(&order.client_txn_id).cloned();

        if let Some(stored) = &previous {
            if stored.status.is_terminal() {
                return Ok(stored.clone());
            }
        }

        let mut next = order.clone();
        if let Some(stored) = &previous {
            next.created_at = stored.created_at;
            next.refund_required |= stored.refund_required;
            if next.provider_txn_id.is_none() {
                next.provider_txn_id = stored.provider_txn_id.clone();
            }
            if next.gateway_raw.is_none() {
                next.gateway_raw = stored.gateway_raw.clone();
            }
        }

        let from = previous.as_ref().map(|p| p.status);
        if from != Some(next.status) {
            state.push_audit(
                &next.client_txn_id,
                from,
                next.status,
                next.gateway_raw.clone(),
                next.updated_at,
            );
        }
        state.orders.insert(next.client_txn_id.clone(), next.clone());
        Ok(next)
    }

    async fn find_by_client_txn_id(
        &self,
        client_txn_id: &str,
    ) -> Result<Option<PaymentOrder>, DatabaseError> {
        Ok(self.state.lock().await.orders.get(client_txn_id).cloned())
    }

    async fn find_by_provider_txn_id(
        &self,
        provider_txn_id: &str,
    ) -> Result<Option<PaymentOrder>, DatabaseError> {
        let state = self.state.lock().await;
        if let Some(order) = state
            .orders
            .values()
            .find(|o| o.provider_txn_id.as_deref() == Some(provider_txn_id))
        {
            return Ok(Some(order.clone()));
        }

        if !is_scannable_provider_id(provider_txn_id) {
            return Ok(None);
        }

        let since = self.clock.now() - chrono::Duration::hours(PROVIDER_ID_SCAN_WINDOW_HOURS);
        let mut recent: Vec<&PaymentOrder> = state
            .orders
            .values()
            .filter(|o| o.created_at >= since)
            .collect();
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(recent
            .into_iter()
            .take(PROVIDER_ID_SCAN_LIMIT as usize)
            .find(|o| {
                o.gateway_raw
                    .as_ref()
                    .map(|raw| raw.to_string().contains(provider_txn_id))
                    .unwrap_or(false)
            })
            .cloned())
    }

    async fn update_status(
        &self,
        client_txn_id: &str,
        next: OrderStatus,
        change: StatusChange,
    ) -> Result<TransitionOutcome, DatabaseError> {
        self.failures.check()?;
        let mut state = self.state.lock().await;
        let current = state
            .orders
            .get(client_txn_id)
            .cloned()
            .ok_or_else(|| DatabaseError::not_found("PaymentOrder", client_txn_id))?;

        if !current.status.can_transition_to(next) {
            return Ok(TransitionOutcome::Skipped(current));
        }

        let mut updated = current.clone();
        change.apply(&mut updated, next);
        state
            .orders
            .insert(client_txn_id.to_string(), updated.clone());
        state.push_audit(
            client_txn_id,
            Some(current.status),
            next,
            change.raw_payload.clone(),
            change.at,
        );
        Ok(TransitionOutcome::Applied(updated))
    }

    async fn record_late_payment(
        &self,
        client_txn_id: &str,
        change: StatusChange,
    ) -> Result<Option<PaymentOrder>, DatabaseError> {
        self.failures.check()?;
        let mut state = self.state.lock().await;
        let updated = match state.orders.get_mut(client_txn_id) {
            Some(order) if order.status == OrderStatus::Timeout => {
                change.apply(order, OrderStatus::Timeout);
                order.clone()
            }
            _ => return Ok(None),
        };
        state.push_audit(
            client_txn_id,
            Some(OrderStatus::Timeout),
            OrderStatus::Timeout,
            change.raw_payload.clone(),
            change.at,
        );
        Ok(Some(updated))
    }

    async fn record_check(
        &self,
        client_txn_id: &str,
        at: DateTime<Utc>,
        raw_payload: Option<JsonValue>,
    ) -> Result<(), DatabaseError> {
        self.failures.check()?;
        let mut state = self.state.lock().await;
        if let Some(order) = state.orders.get_mut(client_txn_id) {
            if !order.status.is_terminal() {
                order.last_checked_at = Some(at);
                if raw_payload.is_some() {
                    order.gateway_raw = raw_payload;
                }
            }
        }
        Ok(())
    }

    async fn list_pending(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentOrder>, DatabaseError> {
        Ok(self.pending_where(limit, |o| o.created_at >= since).await)
    }

    async fn list_pending_before(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentOrder>, DatabaseError> {
        Ok(self.pending_where(limit, |o| o.created_at < before).await)
    }

    async fn audit_trail(
        &self,
        client_txn_id: &str,
    ) -> Result<Vec<OrderAuditEntry>, DatabaseError> {
        Ok(self
            .state
            .lock()
            .await
            .audit
            .iter()
            .filter(|entry| entry.client_txn_id == client_txn_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryBookingStore {
    bookings: Mutex<HashMap<Uuid, Booking>>,
    failures: FailureInjector,
}

impl InMemoryBookingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject_write_failures(&self, count: u32) {
        self.failures.arm(count);
    }

    /// Inserts a booking as-is, bypassing conflict checks.
    pub async fn seed(&self, booking: Booking) {
        self.bookings.lock().await.insert(booking.id, booking);
    }

    pub async fn all(&self) -> Vec<Booking> {
        let mut all: Vec<Booking> = self.bookings.lock().await.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    fn new_booking(
        slot: &SlotKey,
        status: BookingStatus,
        payment_status: PaymentStatus,
        amount_minor: i64,
        client_txn_id: Option<String>,
        at: DateTime<Utc>,
    ) -> Booking {
        Booking {
            id: Uuid::new_v4(),
            slot: slot.clone(),
            status,
            payment_status,
            amount_minor,
            client_txn_id,
            created_at: at,
            updated_at: at,
        }
    }
}

#[async_trait]
impl BookingStore for InMemoryBookingStore {
    async fn create_pending(&self, new: NewBooking) -> Result<Booking, DatabaseError> {
        self.failures.check()?;
        let mut bookings = self.bookings.lock().await;
        if !find_conflicts(bookings.values(), &new.slot, None).is_empty() {
            return Err(DatabaseError::new(DatabaseErrorKind::SlotConflict {
                message: new.slot.to_string(),
            }));
        }
        let booking = Self::new_booking(
            &new.slot,
            BookingStatus::Pending,
            PaymentStatus::Pending,
            new.amount_minor,
            None,
            new.at,
        );
        bookings.insert(booking.id, booking.clone());
        Ok(booking)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Booking>, DatabaseError> {
        Ok(self.bookings.lock().await.get(&id).cloned())
    }

    async fn list_active_for_slot(&self, slot: &SlotKey) -> Result<Vec<Booking>, DatabaseError> {
        let bookings = self.bookings.lock().await;
        let mut active: Vec<Booking> = bookings
            .values()
            .filter(|b| b.status.holds_slot() && b.slot.overlaps(slot))
            .cloned()
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(active)
    }

    async fn finalize_paid(
        &self,
        request: FinalizeRequest,
    ) -> Result<FinalizeOutcome, DatabaseError> {
        self.failures.check()?;
        let mut bookings = self.bookings.lock().await;

        if let Some(existing) = bookings
            .values()
            .find(|b| b.client_txn_id.as_deref() == Some(request.client_txn_id.as_str()))
        {
            return Ok(previous_outcome(existing.clone()));
        }

        let held_by = find_conflicts(bookings.values(), &request.slot, request.booking_id);

        let Some(booking_id) = request.booking_id else {
            if !held_by.is_empty() {
                return Ok(FinalizeOutcome::Conflict {
                    booking: None,
                    held_by,
                });
            }
            let booking = Self::new_booking(
                &request.slot,
                BookingStatus::Confirmed,
                PaymentStatus::Paid,
                request.amount_minor,
                Some(request.client_txn_id.clone()),
                request.at,
            );
            bookings.insert(booking.id, booking.clone());
            return Ok(FinalizeOutcome::Confirmed(booking));
        };

        let booking = bookings
            .get_mut(&booking_id)
            .ok_or_else(|| DatabaseError::not_found("Booking", booking_id))?;

        let outcome = match settle_action(booking.status, held_by.is_empty()) {
            SettleAction::Confirm => {
                booking.status = BookingStatus::Confirmed;
                booking.payment_status = PaymentStatus::Paid;
                booking.client_txn_id = Some(request.client_txn_id.clone());
                booking.updated_at = request.at;
                FinalizeOutcome::Confirmed(booking.clone())
            }
            SettleAction::MarkConflict => {
                booking.status = BookingStatus::ConflictFailed;
                booking.payment_status = PaymentStatus::Paid;
                booking.client_txn_id = Some(request.client_txn_id.clone());
                booking.updated_at = request.at;
                FinalizeOutcome::Conflict {
                    booking: Some(booking.clone()),
                    held_by,
                }
            }
            SettleAction::AlreadySettled => FinalizeOutcome::Conflict {
                booking: Some(booking.clone()),
                held_by,
            },
        };
        Ok(outcome)
    }

    async fn cancel_pending(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<Booking>, DatabaseError> {
        self.failures.check()?;
        let mut bookings = self.bookings.lock().await;
        match bookings.get_mut(&id) {
            Some(booking) if booking.status == BookingStatus::Pending => {
                booking.status = BookingStatus::Cancelled;
                booking.payment_status = PaymentStatus::Failed;
                booking.updated_at = at;
                Ok(Some(booking.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::order_repository::BookingRef;
    use crate::payments::types::{CustomerInfo, UpiIntentLinks};
    use serde_json::json;

    fn order(client_txn_id: &str, status: OrderStatus) -> PaymentOrder {
        let now = Utc::now();
        PaymentOrder {
            client_txn_id: client_txn_id.to_string(),
            order_id: None,
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
            payment_url: None,
            upi_intent: UpiIntentLinks::default(),
            refund_required: false,
            failure_reason: None,
            gateway_raw: None,
            created_at: now,
            updated_at: now,
            last_checked_at: None,
        }
    }

    #[tokio::test]
    async fn create_rejects_duplicate_client_txn_id() {
        let store = InMemoryOrderStore::new();
        store.create(&order("txn_1", OrderStatus::Created)).await.expect("first insert");
        let err = store
            .create(&order("txn_1", OrderStatus::Created))
            .await
            .expect_err("duplicate");
        assert!(matches!(err.kind, DatabaseErrorKind::UniqueViolation { .. }));
    }

    #[tokio::test]
    async fn save_never_reopens_a_terminal_order() {
        let store = InMemoryOrderStore::new();
        store.create(&order("txn_1", OrderStatus::Pending)).await.expect("insert");
        store
            .update_status("txn_1", OrderStatus::Failed, StatusChange::at(Utc::now()))
            .await
            .expect("fail order");

        let saved = store
            .save(&order("txn_1", OrderStatus::Pending))
            .await
            .expect("save");
        assert_eq!(saved.status, OrderStatus::Failed);
    }

    #[tokio::test]
    async fn update_status_skips_invalid_transitions_and_audits_applied_ones() {
        let store = InMemoryOrderStore::new();
        store.create(&order("txn_1", OrderStatus::Pending)).await.expect("insert");

        let applied = store
            .update_status(
                "txn_1",
                OrderStatus::Completed,
                StatusChange::at(Utc::now())
                    .with_provider_txn_id(Some("TXN1".to_string()))
                    .with_raw(Some(json!({"status": "success"}))),
            )
            .await
            .expect("complete");
        assert!(applied.was_applied());
        assert_eq!(applied.order().provider_txn_id.as_deref(), Some("TXN1"));

        let skipped = store
            .update_status("txn_1", OrderStatus::Timeout, StatusChange::at(Utc::now()))
            .await
            .expect("second update");
        assert!(!skipped.was_applied());
        assert_eq!(skipped.order().status, OrderStatus::Completed);

        let trail = store.audit_trail("txn_1").await.expect("audit");
        let statuses: Vec<OrderStatus> = trail.iter().map(|e| e.to_status).collect();
        assert_eq!(statuses, vec![OrderStatus::Pending, OrderStatus::Completed]);
    }

    #[tokio::test]
    async fn provider_id_falls_back_to_raw_payload_scan() {
        let store = InMemoryOrderStore::new();
        let mut with_raw = order("txn_1", OrderStatus::Pending);
        with_raw.gateway_raw = Some(json!({"data": {"upi_txn_id": "UPI998877"}}));
        store.create(&with_raw).await.expect("insert");

        let found = store
            .find_by_provider_txn_id("UPI998877")
            .await
            .expect("lookup")
            .expect("order found");
        assert_eq!(found.client_txn_id, "txn_1");

        assert!(store
            .find_by_provider_txn_id("%UPI%")
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_one_per_write() {
        let store = InMemoryOrderStore::new();
        store.inject_write_failures(1);
        assert!(store.create(&order("txn_1", OrderStatus::Created)).await.is_err());
        assert!(store.create(&order("txn_1", OrderStatus::Created)).await.is_ok());
    }

    #[tokio::test]
    async fn finalize_is_idempotent_per_payment() {
        let store = InMemoryBookingStore::new();
        let request = FinalizeRequest {
            client_txn_id: "txn_1".to_string(),
            slot: "hallA|2024-06-17|09:00-17:00".parse().expect("valid slot"),
            amount_minor: 50_000,
            booking_id: None,
            at: Utc::now(),
        };

        let first = store.finalize_paid(request.clone()).await.expect("finalize");
        let second = store.finalize_paid(request).await.expect("finalize again");

        let FinalizeOutcome::Confirmed(booking) = first else {
            panic!("expected confirmation, got {:?}", first);
        };
        assert_eq!(second, FinalizeOutcome::AlreadyFinalized(booking));
        assert_eq!(store.all().await.len(), 1);
    }

    #[tokio::test]
    async fn create_pending_refuses_overlapping_slot() {
        let store = InMemoryBookingStore::new();
        let slot: SlotKey = "hallA|2024-06-17|09:00-13:00".parse().expect("valid slot");
        store
            .create_pending(NewBooking {
                slot: slot.clone(),
                amount_minor: 50_000,
                at: Utc::now(),
            })
            .await
            .expect("first booking");

        let err = store
            .create_pending(NewBooking {
                slot: "hallA|2024-06-17|12:00-14:00".parse().expect("valid slot"),
                amount_minor: 50_000,
                at: Utc::now(),
            })
            .await
            .expect_err("overlap");
        assert!(matches!(err.kind, DatabaseErrorKind::SlotConflict { .. }));
    }

    #[tokio::test]
    async fn cancel_only_touches_pending_bookings() {
        let store = InMemoryBookingStore::new();
        let booking = store
            .create_pending(NewBooking {
                slot: "hallA|2024-06-17|09:00-13:00".parse().expect("valid slot"),
                amount_minor: 50_000,
                at: Utc::now(),
            })
            .await
            .expect("booking");

        let cancelled = store
            .cancel_pending(booking.id, Utc::now())
            .await
            .expect("cancel")
            .expect("was pending");
        assert_eq!(cancelled.status, BookingStatus::Cancelled);
        assert_eq!(cancelled.payment_status, PaymentStatus::Failed);

        assert!(store
            .cancel_pending(booking.id, Utc::now())
            .await
            .expect("cancel again")
            .is_none());
    }
}
