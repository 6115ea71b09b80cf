//! Payment reconciliation
//!
//! Ties the gateway, the order and booking stores, the conflict checker and
//! the status poller together. Every terminal outcome goes through
//! [`ReconciliationService::on_status_update`], which reads the persisted
//! order first and does nothing if it is already terminal, so duplicate
//! poll results and provider callbacks are harmless. The one exception is a
//! success reported for a timed-out order, which is recorded for refund
//! review without changing the status.

use crate::config::{PollerConfig, ReconcileConfig};
use crate::database::booking_repository::{
    Booking, BookingStatus, BookingStore, FinalizeOutcome, FinalizeRequest, SlotKey,
};
use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::database::order_repository::{
    BookingRef, OrderStatus, OrderStore, PaymentOrder, StatusChange, TransitionOutcome,
};
use crate::error::{
    AppError, AppErrorKind, DomainError, InfrastructureError, ValidationError,
};
use crate::payments::types::normalize_mobile;
use crate::payments::utils::gateway_txn_date;
use crate::payments::{
    CreateOrderRequest, CustomerInfo, GatewayError, GatewayStatus, PaymentGateway, StatusCheck,
};
use crate::services::clock::Clock;
use crate::services::conflict_checker::ConflictChecker;
use crate::workers::status_poller::{PollOutcome, PollTick, PollerHandle, StatusPoller};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const PRODUCT_INFO: &str = "Study hall booking";

// ============================================================================
// Requests and events
// ============================================================================

/// Which booking a payment is for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "flow", rename_all = "snake_case")]
pub enum BookingFlow {
    /// No booking yet; it is created when the payment succeeds.
    PayFirst { slot: SlotKey },
    /// A `pending` booking already holds the slot.
    BookThenPay { booking_id: Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiateRequest {
    /// Caller-supplied idempotency key; generated when absent.
    pub client_txn_id: Option<String>,
    pub amount_minor: i64,
    pub customer: CustomerInfo,
    #[serde(flatten)]
    pub flow: BookingFlow,
}

impl InitiateRequest {
    /// Whether a retry with the same client transaction id asks for the same
    /// payment as the stored order.
    fn matches_order(&self, order: &PaymentOrder) -> bool {
        if self.amount_minor != order.amount_minor {
            return false;
        }
        match &self.flow {
            BookingFlow::PayFirst { slot } => {
                order.booking_ref.booking_id().is_none() && order.slot.as_ref() == Some(slot)
            }
            BookingFlow::BookThenPay { booking_id } => {
                order.booking_ref.booking_id() == Some(*booking_id)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStage {
    OrderCreated,
    AwaitingPayment,
    Polling,
    Confirmed,
    ConflictRefundPending,
    Failed,
    TimedOut,
    Cancelled,
    NeedsSupport,
}

impl ReconciliationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationStage::OrderCreated => "order_created",
            ReconciliationStage::AwaitingPayment => "awaiting_payment",
            ReconciliationStage::Polling => "polling",
            ReconciliationStage::Confirmed => "confirmed",
            ReconciliationStage::ConflictRefundPending => "conflict_refund_pending",
            ReconciliationStage::Failed => "failed",
            ReconciliationStage::TimedOut => "timed_out",
            ReconciliationStage::Cancelled => "cancelled",
            ReconciliationStage::NeedsSupport => "needs_support",
        }
    }

    /// No further events follow for the order.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            ReconciliationStage::OrderCreated
                | ReconciliationStage::AwaitingPayment
                | ReconciliationStage::Polling
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationEvent {
    pub client_txn_id: String,
    pub stage: ReconciliationStage,
    /// Absent only when the order could not be read back from the store.
    pub order: Option<PaymentOrder>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Completed,
    Failed,
    Timeout,
}

/// A terminal status report, from the poller or from a provider callback.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub status: TerminalStatus,
    pub provider_txn_id: Option<String>,
    pub reason: Option<String>,
    pub raw: Option<JsonValue>,
}

impl StatusUpdate {
    pub fn completed(provider_txn_id: Option<String>) -> Self {
        Self {
            status: TerminalStatus::Completed,
            provider_txn_id,
            reason: None,
            raw: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: TerminalStatus::Failed,
            provider_txn_id: None,
            reason: Some(reason.into()),
            raw: None,
        }
    }

    pub fn timeout(waited: Duration) -> Self {
        Self {
            status: TerminalStatus::Timeout,
            provider_txn_id: None,
            reason: Some(format!(
                "no terminal status from the gateway after {}s",
                waited.as_secs()
            )),
            raw: None,
        }
    }

    pub fn with_raw(mut self, raw: Option<JsonValue>) -> Self {
        self.raw = raw;
        self
    }

    pub fn with_provider_txn_id(mut self, provider_txn_id: Option<String>) -> Self {
        self.provider_txn_id = provider_txn_id;
        self
    }
}

impl From<PollOutcome> for StatusUpdate {
    fn from(outcome: PollOutcome) -> Self {
        match outcome {
            PollOutcome::Completed { report } => {
                StatusUpdate::completed(report.provider_txn_id).with_raw(Some(report.raw))
            }
            PollOutcome::Failed { report } => {
                StatusUpdate::failed(format!("gateway reported '{}'", report.provider_status))
                    .with_provider_txn_id(report.provider_txn_id)
                    .with_raw(Some(report.raw))
            }
            PollOutcome::Rejected { error } => StatusUpdate::failed(error.message().to_string()),
            PollOutcome::TimedOut { elapsed, .. } => StatusUpdate::timeout(elapsed),
        }
    }
}

/// Status pushed by the provider or an operator instead of polled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCallback {
    pub client_txn_id: Option<String>,
    pub provider_txn_id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub raw: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Confirmed {
        order: PaymentOrder,
        booking: Booking,
    },
    /// Paid, but the slot was taken. The order is `completed` with a refund flag.
    ConflictRefund {
        order: PaymentOrder,
        booking: Option<Booking>,
        held_by: Vec<Uuid>,
    },
    Failed {
        order: PaymentOrder,
        released: Option<Booking>,
    },
    TimedOut {
        order: PaymentOrder,
    },
    /// Success reported after the order timed out. The order stays `timeout`
    /// and is flagged for refund review.
    LatePayment {
        order: PaymentOrder,
    },
    /// Callback reported a non-terminal status.
    Pending(PaymentOrder),
    /// The order was already terminal; nothing changed.
    AlreadyTerminal(PaymentOrder),
}

impl ReconcileOutcome {
    pub fn order(&self) -> &PaymentOrder {
        match self {
            ReconcileOutcome::Confirmed { order, .. }
            | ReconcileOutcome::ConflictRefund { order, .. }
            | ReconcileOutcome::Failed { order, .. }
            | ReconcileOutcome::TimedOut { order }
            | ReconcileOutcome::LatePayment { order }
            | ReconcileOutcome::Pending(order)
            | ReconcileOutcome::AlreadyTerminal(order) => order,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileOutcome::Confirmed { .. } => "confirmed",
            ReconcileOutcome::ConflictRefund { .. } => "conflict_refund",
            ReconcileOutcome::Failed { .. } => "failed",
            ReconcileOutcome::TimedOut { .. } => "timed_out",
            ReconcileOutcome::LatePayment { .. } => "late_payment",
            ReconcileOutcome::Pending(_) => "pending",
            ReconcileOutcome::AlreadyTerminal(_) => "already_terminal",
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum ReconcileError {
    #[error("order {client_txn_id} already exists")]
    DuplicateOrder { client_txn_id: String },

    #[error("order {client_txn_id} is already being polled")]
    PollerAlreadyActive { client_txn_id: String },

    #[error("order {client_txn_id} not found")]
    OrderNotFound { client_txn_id: String },

    #[error("order {client_txn_id} is already {status}")]
    OrderAlreadyFinal {
        client_txn_id: String,
        status: OrderStatus,
    },

    #[error("booking {booking_id} not found")]
    BookingNotFound { booking_id: Uuid },

    #[error("booking {booking_id} is {status}, not pending")]
    BookingNotPending {
        booking_id: Uuid,
        status: BookingStatus,
    },

    #[error("slot {slot} is already held")]
    SlotUnavailable { slot: SlotKey, held_by: Vec<Uuid> },

    #[error("invalid amount {amount_minor}: {reason}")]
    InvalidAmount { amount_minor: i64, reason: String },

    #[error("invalid callback: {reason}")]
    InvalidCallback { reason: String },

    #[error("order {client_txn_id} is inconsistent: {reason}")]
    InvalidOrder {
        client_txn_id: String,
        reason: String,
    },

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Store unavailable after retries. Persisted state was left as it was.
    #[error("could not persist order {client_txn_id}: {message}")]
    Persistence {
        client_txn_id: String,
        message: String,
    },
}

impl ReconcileError {
    fn persistence(client_txn_id: &str, err: DatabaseError) -> Self {
        ReconcileError::Persistence {
            client_txn_id: client_txn_id.to_string(),
            message: err.to_string(),
        }
    }
}

impl From<ReconcileError> for AppError {
    fn from(err: ReconcileError) -> Self {
        let context = err.to_string();
        let kind = match err {
            ReconcileError::DuplicateOrder { client_txn_id }
            | ReconcileError::PollerAlreadyActive { client_txn_id } => {
                AppErrorKind::Domain(DomainError::DuplicateOrder { client_txn_id })
            }
            ReconcileError::OrderNotFound { client_txn_id } => {
                AppErrorKind::Domain(DomainError::OrderNotFound { client_txn_id })
            }
            ReconcileError::OrderAlreadyFinal {
                client_txn_id,
                status,
            } => AppErrorKind::Domain(DomainError::OrderAlreadyFinal {
                client_txn_id,
                status: status.to_string(),
            }),
            ReconcileError::BookingNotFound { booking_id } => {
                AppErrorKind::Domain(DomainError::BookingNotFound {
                    booking_id: booking_id.to_string(),
                })
            }
            ReconcileError::BookingNotPending { status, .. } => {
                AppErrorKind::Validation(ValidationError::InvalidField {
                    field: "booking_id".to_string(),
                    reason: format!("booking is {}", status),
                })
            }
            ReconcileError::SlotUnavailable { slot, .. } => {
                AppErrorKind::Domain(DomainError::SlotConflict {
                    slot: slot.to_string(),
                })
            }
            ReconcileError::InvalidAmount {
                amount_minor,
                reason,
            } => AppErrorKind::Validation(ValidationError::InvalidAmount {
                amount: amount_minor.to_string(),
                reason,
            }),
            ReconcileError::InvalidCallback { reason } => {
                AppErrorKind::Validation(ValidationError::InvalidField {
                    field: "callback".to_string(),
                    reason,
                })
            }
            ReconcileError::Gateway(gateway) => return AppError::from(gateway),
            ReconcileError::InvalidOrder {
                client_txn_id,
                reason,
            } => AppErrorKind::Infrastructure(InfrastructureError::Persistence {
                client_txn_id,
                message: reason,
            }),
            ReconcileError::Persistence {
                client_txn_id,
                message,
            } => AppErrorKind::Infrastructure(InfrastructureError::Persistence {
                client_txn_id,
                message,
            }),
        };
        AppError::new(kind).with_context(context)
    }
}

// ============================================================================
// Service
// ============================================================================

enum PollerSignal {
    Tick(PollTick),
    Outcome(PollOutcome),
}

pub struct ReconciliationService {
    gateway: Arc<dyn PaymentGateway>,
    orders: Arc<dyn OrderStore>,
    bookings: Arc<dyn BookingStore>,
    conflicts: ConflictChecker,
    poller: StatusPoller,
    clock: Arc<dyn Clock>,
    config: ReconcileConfig,
    events: broadcast::Sender<ReconciliationEvent>,
    pollers: Mutex<HashMap<String, PollerHandle>>,
}

impl ReconciliationService {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        orders: Arc<dyn OrderStore>,
        bookings: Arc<dyn BookingStore>,
        clock: Arc<dyn Clock>,
        poller_config: PollerConfig,
        config: ReconcileConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            poller: StatusPoller::new(gateway.clone(), clock.clone(), poller_config),
            conflicts: ConflictChecker::new(bookings.clone()),
            gateway,
            orders,
            bookings,
            clock,
            config,
            events,
            pollers: Mutex::new(HashMap::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconciliationEvent> {
        self.events.subscribe()
    }

    pub fn poller_config(&self) -> PollerConfig {
        self.poller.config()
    }

    pub fn is_polling(&self, client_txn_id: &str) -> bool {
        self.registry()
            .get(client_txn_id)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn active_pollers(&self) -> usize {
        self.registry()
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    pub async fn order(&self, client_txn_id: &str) -> Result<PaymentOrder, ReconcileError> {
        self.load_order(client_txn_id).await
    }

    // ------------------------------------------------------------------------
    // Initiation
    // ------------------------------------------------------------------------

    /// Creates the gateway order and persists it as `pending`. The returned
    /// order carries the payment URL and UPI intent links to render.
    pub async fn initiate(&self, request: InitiateRequest) -> Result<PaymentOrder, ReconcileError> {
        let client_txn_id = request
            .client_txn_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("SH{}", Uuid::new_v4().simple()));

        let order = match self
            .orders
            .find_by_client_txn_id(&client_txn_id)
            .await
            .map_err(|e| ReconcileError::persistence(&client_txn_id, e))?
        {
            Some(existing) if existing.status == OrderStatus::Created => {
                if !request.matches_order(&existing) {
                    warn!(
                        client_txn_id = %client_txn_id,
                        stored_amount_minor = existing.amount_minor,
                        requested_amount_minor = request.amount_minor,
                        "retry does not match the stored order"
                    );
                    return Err(ReconcileError::DuplicateOrder {
                        client_txn_id: existing.client_txn_id,
                    });
                }
                info!(client_txn_id = %client_txn_id, "resuming order that never reached the gateway");
                existing
            }
            Some(existing) if existing.status == OrderStatus::Pending && self.is_polling(&client_txn_id) => {
                return Err(ReconcileError::PollerAlreadyActive {
                    client_txn_id: existing.client_txn_id,
                });
            }
            Some(existing) => {
                return Err(ReconcileError::DuplicateOrder {
                    client_txn_id: existing.client_txn_id,
                });
            }
            None => self.create_order_record(client_txn_id, request).await?,
        };

        self.submit_to_gateway(order).await
    }

    /// [`initiate`](Self::initiate) followed by [`watch`](Self::watch).
    pub async fn initiate_and_watch(
        self: &Arc<Self>,
        request: InitiateRequest,
    ) -> Result<PaymentOrder, ReconcileError> {
        let order = self.initiate(request).await?;
        self.ensure_watched(&order.client_txn_id).await?;
        Ok(order)
    }

    /// [`watch`](Self::watch), but a poller already running for the order,
    /// for instance one started by the recovery sweep, counts as success.
    pub async fn ensure_watched(self: &Arc<Self>, client_txn_id: &str) -> Result<(), ReconcileError> {
        match self.watch(client_txn_id).await {
            Ok(_) => Ok(()),
            Err(ReconcileError::PollerAlreadyActive { .. }) => {
                debug!(client_txn_id = %client_txn_id, "order already being polled");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn create_order_record(
        &self,
        client_txn_id: String,
        request: InitiateRequest,
    ) -> Result<PaymentOrder, ReconcileError> {
        if request.amount_minor <= 0 {
            return Err(ReconcileError::InvalidAmount {
                amount_minor: request.amount_minor,
                reason: "amount must be greater than zero".to_string(),
            });
        }
        request.customer.validate()?;

        let (slot, booking_ref) = match &request.flow {
            BookingFlow::PayFirst { slot } => {
                let held_by = self
                    .conflicts
                    .conflicting_bookings(slot, None)
                    .await
                    .map_err(|e| ReconcileError::persistence(&client_txn_id, e))?;
                if !held_by.is_empty() {
                    return Err(ReconcileError::SlotUnavailable {
                        slot: slot.clone(),
                        held_by,
                    });
                }
                (slot.clone(), BookingRef::placeholder())
            }
            BookingFlow::BookThenPay { booking_id } => {
                let booking = self
                    .bookings
                    .find_by_id(*booking_id)
                    .await
                    .map_err(|e| ReconcileError::persistence(&client_txn_id, e))?
                    .ok_or(ReconcileError::BookingNotFound {
                        booking_id: *booking_id,
                    })?;
                if booking.status != BookingStatus::Pending {
                    return Err(ReconcileError::BookingNotPending {
                        booking_id: booking.id,
                        status: booking.status,
                    });
                }
                if booking.amount_minor != request.amount_minor {
                    return Err(ReconcileError::InvalidAmount {
                        amount_minor: request.amount_minor,
                        reason: format!("booking amount is {}", booking.amount_minor),
                    });
                }
                (booking.slot, BookingRef::Booking(booking.id))
            }
        };

        let now = self.clock.now();
        let customer = CustomerInfo {
            name: request.customer.name.trim().to_string(),
            email: request.customer.email.trim().to_string(),
            mobile: normalize_mobile(&request.customer.mobile),
        };
        let order = PaymentOrder {
            client_txn_id: client_txn_id.clone(),
            order_id: None,
            provider_txn_id: None,
            amount_minor: request.amount_minor,
            status: OrderStatus::Created,
            booking_ref,
            slot: Some(slot),
            customer,
            txn_date: gateway_txn_date(now),
            payment_url: None,
            upi_intent: Default::default(),
            refund_required: false,
            failure_reason: None,
            gateway_raw: None,
            created_at: now,
            updated_at: now,
            last_checked_at: None,
        };

        let created = self
            .with_store_retry("create_order", &client_txn_id, || self.orders.create(&order))
            .await
            .map_err(|e| match e.kind {
                DatabaseErrorKind::UniqueViolation { .. } => ReconcileError::DuplicateOrder {
                    client_txn_id: client_txn_id.clone(),
                },
                _ => ReconcileError::persistence(&client_txn_id, e),
            })?;

        info!(
            client_txn_id = %created.client_txn_id,
            amount_minor = created.amount_minor,
            booking_ref = %created.booking_ref,
            "payment order created"
        );
        self.emit(ReconciliationStage::OrderCreated, &created.client_txn_id, Some(created.clone()), None);
        Ok(created)
    }

    async fn submit_to_gateway(&self, order: PaymentOrder) -> Result<PaymentOrder, ReconcileError> {
        let request = CreateOrderRequest {
            client_txn_id: order.client_txn_id.clone(),
            amount_minor: order.amount_minor,
            customer: order.customer.clone(),
            product_info: PRODUCT_INFO.to_string(),
            booking_reference: order.booking_ref.to_string(),
            slot: order.slot.as_ref().map(|slot| slot.to_string()),
        };

        let created = match self.gateway.create_order(request).await {
            Ok(created) => created,
            Err(err @ GatewayError::Unavailable { .. }) => {
                warn!(
                    client_txn_id = %order.client_txn_id,
                    gateway = self.gateway.name(),
                    error = %err,
                    "gateway unavailable, order left in created state"
                );
                return Err(err.into());
            }
            Err(err) => {
                warn!(
                    client_txn_id = %order.client_txn_id,
                    gateway = self.gateway.name(),
                    error = %err,
                    "gateway rejected order"
                );
                let change = StatusChange::at(self.clock.now()).with_failure_reason(err.message());
                if let Ok(failed) = self.transition(&order.client_txn_id, OrderStatus::Failed, change).await {
                    self.emit(
                        ReconciliationStage::Failed,
                        &order.client_txn_id,
                        Some(failed.into_order()),
                        Some(err.user_message()),
                    );
                }
                return Err(err.into());
            }
        };

        let mut pending = order.clone();
        pending.status = OrderStatus::Pending;
        pending.order_id = Some(created.order_id);
        pending.payment_url = created.payment_url;
        pending.upi_intent = created.upi_intent;
        pending.gateway_raw = Some(created.raw);
        pending.updated_at = self.clock.now();

        let saved = self
            .with_store_retry("save_order", &order.client_txn_id, || self.orders.save(&pending))
            .await
            .map_err(|e| ReconcileError::persistence(&order.client_txn_id, e))?;

        info!(
            client_txn_id = %saved.client_txn_id,
            order_id = ?saved.order_id,
            "awaiting UPI payment"
        );
        self.emit(ReconciliationStage::AwaitingPayment, &saved.client_txn_id, Some(saved.clone()), None);
        Ok(saved)
    }

    // ------------------------------------------------------------------------
    // Polling
    // ------------------------------------------------------------------------

    /// Starts the single poller for a pending order. The polling budget is
    /// measured from the order's creation, so a resumed order keeps its
    /// original deadline.
    pub async fn watch(self: &Arc<Self>, client_txn_id: &str) -> Result<PollerHandle, ReconcileError> {
        let order = self.load_order(client_txn_id).await?;
        match order.status {
            OrderStatus::Pending => {}
            OrderStatus::Created => {
                return Err(ReconcileError::InvalidOrder {
                    client_txn_id: order.client_txn_id,
                    reason: "order was never accepted by the gateway".to_string(),
                })
            }
            status => {
                return Err(ReconcileError::OrderAlreadyFinal {
                    client_txn_id: order.client_txn_id,
                    status,
                })
            }
        }

        let check = StatusCheck::new(order.client_txn_id.clone(), &order.txn_date)?;
        let spent = (self.clock.now() - order.created_at)
            .to_std()
            .unwrap_or_default();
        let budget = self.poller.config().max_duration.saturating_sub(spent);

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = {
            let mut pollers = self.registry();
            if pollers
                .get(client_txn_id)
                .map(|existing| !existing.is_finished())
                .unwrap_or(false)
            {
                return Err(ReconcileError::PollerAlreadyActive {
                    client_txn_id: client_txn_id.to_string(),
                });
            }

            let tick_tx = tx.clone();
            let handle = self.poller.start_with_budget(
                check,
                budget,
                move |tick| {
                    let _ = tick_tx.send(PollerSignal::Tick(tick));
                },
                move |outcome| {
                    let _ = tx.send(PollerSignal::Outcome(outcome));
                },
            );
            pollers.insert(client_txn_id.to_string(), handle.clone());
            handle
        };

        let service = Arc::clone(self);
        tokio::spawn(async move { service.consume(order, rx).await });
        Ok(handle)
    }

    async fn consume(&self, mut order: PaymentOrder, mut rx: mpsc::UnboundedReceiver<PollerSignal>) {
        let client_txn_id = order.client_txn_id.clone();

        while let Some(signal) = rx.recv().await {
            match signal {
                PollerSignal::Tick(tick) => {
                    if let Err(e) = self
                        .orders
                        .record_check(&client_txn_id, tick.at, Some(tick.report.raw.clone()))
                        .await
                    {
                        warn!(client_txn_id = %client_txn_id, error = %e, "could not record status check");
                    }
                    order.last_checked_at = Some(tick.at);
                    order.gateway_raw = Some(tick.report.raw);
                    self.emit(ReconciliationStage::Polling, &client_txn_id, Some(order.clone()), None);
                }
                PollerSignal::Outcome(outcome) => {
                    if let Err(e) = self.on_status_update(&client_txn_id, outcome.into()).await {
                        error!(client_txn_id = %client_txn_id, error = %e, "reconciliation failed");
                    }
                    break;
                }
            }
        }

        self.release_poller(&client_txn_id);
    }

    /// Stops polling without touching persisted state.
    pub fn detach(&self, client_txn_id: &str) -> bool {
        let handle = self.registry().remove(client_txn_id);
        match handle {
            Some(handle) => {
                handle.stop();
                true
            }
            None => false,
        }
    }

    /// Stops every poller; used on shutdown.
    pub fn detach_all(&self) {
        let handles: Vec<PollerHandle> = self.registry().drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.stop();
        }
    }

    fn release_poller(&self, client_txn_id: &str) {
        let mut pollers = self.registry();
        if pollers
            .get(client_txn_id)
            .map(|handle| handle.is_finished())
            .unwrap_or(false)
        {
            pollers.remove(client_txn_id);
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, PollerHandle>> {
        self.pollers.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------------
    // Terminal outcomes
    // ------------------------------------------------------------------------

    pub async fn on_status_update(
        &self,
        client_txn_id: &str,
        update: StatusUpdate,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let order = match self.load_order(client_txn_id).await {
            Ok(order) => order,
            Err(err) => {
                if matches!(err, ReconcileError::Persistence { .. }) {
                    self.emit(
                        ReconciliationStage::NeedsSupport,
                        client_txn_id,
                        None,
                        Some(err.to_string()),
                    );
                }
                return Err(err);
            }
        };

        let late_payment =
            order.status == OrderStatus::Timeout && update.status == TerminalStatus::Completed;
        if order.status.is_terminal() && !late_payment {
            debug!(
                client_txn_id = %client_txn_id,
                status = %order.status,
                reported = ?update.status,
                "order already terminal, ignoring status update"
            );
            return Ok(ReconcileOutcome::AlreadyTerminal(order));
        }

        let result = match update.status {
            TerminalStatus::Completed if late_payment => self.settle_late_payment(&order, update).await,
            TerminalStatus::Completed => self.settle_paid(&order, update).await,
            TerminalStatus::Failed => self.settle_failed(&order, update).await,
            TerminalStatus::Timeout => self.settle_timeout(&order, update).await,
        };

        if let Err(err @ ReconcileError::Persistence { .. }) = &result {
            error!(
                client_txn_id = %client_txn_id,
                error = %err,
                "order state could not be recorded, support follow-up required"
            );
            self.emit(
                ReconciliationStage::NeedsSupport,
                client_txn_id,
                Some(order),
                Some(err.to_string()),
            );
        }
        result
    }

    async fn settle_paid(
        &self,
        order: &PaymentOrder,
        update: StatusUpdate,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let client_txn_id = order.client_txn_id.as_str();
        let slot = order.slot.clone().ok_or_else(|| ReconcileError::InvalidOrder {
            client_txn_id: client_txn_id.to_string(),
            reason: "order has no slot to book".to_string(),
        })?;
        let now = self.clock.now();

        let request = FinalizeRequest {
            client_txn_id: client_txn_id.to_string(),
            slot: slot.clone(),
            amount_minor: order.amount_minor,
            booking_id: order.booking_ref.booking_id(),
            at: now,
        };
        let finalized = self
            .with_store_retry("finalize_paid", client_txn_id, || {
                self.bookings.finalize_paid(request.clone())
            })
            .await
            .map_err(|e| ReconcileError::persistence(client_txn_id, e))?;

        let change = StatusChange::at(now)
            .with_raw(update.raw)
            .with_provider_txn_id(update.provider_txn_id);

        match finalized {
            FinalizeOutcome::Confirmed(booking) | FinalizeOutcome::AlreadyFinalized(booking) => {
                let transition = self
                    .transition(client_txn_id, OrderStatus::Completed, change.with_booking(booking.id))
                    .await?;
                if !transition.was_applied() {
                    return Ok(ReconcileOutcome::AlreadyTerminal(transition.into_order()));
                }
                let order = transition.into_order();
                info!(
                    client_txn_id = %client_txn_id,
                    booking_id = %booking.id,
                    provider_txn_id = ?order.provider_txn_id,
                    slot = %slot,
                    "payment confirmed, booking secured"
                );
                self.emit(ReconciliationStage::Confirmed, client_txn_id, Some(order.clone()), None);
                Ok(ReconcileOutcome::Confirmed { order, booking })
            }
            FinalizeOutcome::Conflict { booking, held_by } => {
                let mut change = change
                    .with_refund_required()
                    .with_failure_reason(format!("slot {} was booked by someone else", slot));
                if let Some(booking) = &booking {
                    change = change.with_booking(booking.id);
                }
                let transition = self
                    .transition(client_txn_id, OrderStatus::Completed, change)
                    .await?;
                if !transition.was_applied() {
                    return Ok(ReconcileOutcome::AlreadyTerminal(transition.into_order()));
                }
                let order = transition.into_order();
                warn!(
                    client_txn_id = %client_txn_id,
                    slot = %slot,
                    held_by = ?held_by,
                    provider_txn_id = ?order.provider_txn_id,
                    "payment received for a slot that is no longer free, refund required"
                );
                self.emit(
                    ReconciliationStage::ConflictRefundPending,
                    client_txn_id,
                    Some(order.clone()),
                    order.failure_reason.clone(),
                );
                Ok(ReconcileOutcome::ConflictRefund {
                    order,
                    booking,
                    held_by,
                })
            }
        }
    }

    async fn settle_failed(
        &self,
        order: &PaymentOrder,
        update: StatusUpdate,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let client_txn_id = order.client_txn_id.as_str();
        let now = self.clock.now();
        let reason = update
            .reason
            .unwrap_or_else(|| "payment failed".to_string());

        let released = match order.booking_ref.booking_id() {
            Some(booking_id) => self
                .with_store_retry("cancel_booking", client_txn_id, || {
                    self.bookings.cancel_pending(booking_id, now)
                })
                .await
                .map_err(|e| ReconcileError::persistence(client_txn_id, e))?,
            None => None,
        };

        let change = StatusChange::at(now)
            .with_raw(update.raw)
            .with_provider_txn_id(update.provider_txn_id)
            .with_failure_reason(reason.clone());
        let transition = self
            .transition(client_txn_id, OrderStatus::Failed, change)
            .await?;
        if !transition.was_applied() {
            return Ok(ReconcileOutcome::AlreadyTerminal(transition.into_order()));
        }

        let order = transition.into_order();
        info!(
            client_txn_id = %client_txn_id,
            reason = %reason,
            released_booking = ?released.as_ref().map(|b| b.id),
            "payment failed"
        );
        self.emit(ReconciliationStage::Failed, client_txn_id, Some(order.clone()), Some(reason));
        Ok(ReconcileOutcome::Failed { order, released })
    }

    /// The booking is left untouched: the payment may still clear.
    async fn settle_timeout(
        &self,
        order: &PaymentOrder,
        update: StatusUpdate,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let client_txn_id = order.client_txn_id.as_str();
        let reason = update
            .reason
            .unwrap_or_else(|| "no terminal status from the gateway".to_string());
        let change = StatusChange::at(self.clock.now())
            .with_raw(update.raw)
            .with_failure_reason(reason.clone());

        let transition = self
            .transition(client_txn_id, OrderStatus::Timeout, change)
            .await?;
        if !transition.was_applied() {
            return Ok(ReconcileOutcome::AlreadyTerminal(transition.into_order()));
        }

        let order = transition.into_order();
        warn!(
            client_txn_id = %client_txn_id,
            booking_ref = %order.booking_ref,
            "payment not confirmed in time, manual verification required"
        );
        self.emit(ReconciliationStage::TimedOut, client_txn_id, Some(order.clone()), Some(reason));
        Ok(ReconcileOutcome::TimedOut { order })
    }

    /// Money moved after the order was given up on. No booking is made; the
    /// order keeps its `timeout` status and is flagged for manual refund.
    async fn settle_late_payment(
        &self,
        order: &PaymentOrder,
        update: StatusUpdate,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let client_txn_id = order.client_txn_id.as_str();
        let already_recorded = order.refund_required
            && (update.provider_txn_id.is_none() || update.provider_txn_id == order.provider_txn_id);
        if already_recorded {
            debug!(client_txn_id = %client_txn_id, "late payment already recorded");
            return Ok(ReconcileOutcome::AlreadyTerminal(order.clone()));
        }

        let change = StatusChange::at(self.clock.now())
            .with_raw(update.raw)
            .with_provider_txn_id(update.provider_txn_id)
            .with_refund_required()
            .with_failure_reason("payment reported after the order timed out, manual review required");
        let recorded = self
            .with_store_retry("record_late_payment", client_txn_id, || {
                self.orders.record_late_payment(client_txn_id, change.clone())
            })
            .await
            .map_err(|e| ReconcileError::persistence(client_txn_id, e))?;

        let Some(order) = recorded else {
            return Ok(ReconcileOutcome::AlreadyTerminal(self.load_order(client_txn_id).await?));
        };

        warn!(
            client_txn_id = %client_txn_id,
            provider_txn_id = ?order.provider_txn_id,
            booking_ref = %order.booking_ref,
            amount_minor = order.amount_minor,
            "payment succeeded after the order timed out, refund review required"
        );
        self.emit(
            ReconciliationStage::NeedsSupport,
            client_txn_id,
            Some(order.clone()),
            order.failure_reason.clone(),
        );
        Ok(ReconcileOutcome::LatePayment { order })
    }

    /// User-initiated cancel of a live order.
    pub async fn cancel(&self, client_txn_id: &str) -> Result<PaymentOrder, ReconcileError> {
        self.detach(client_txn_id);

        let order = self.load_order(client_txn_id).await?;
        if order.status.is_terminal() {
            return Err(ReconcileError::OrderAlreadyFinal {
                client_txn_id: order.client_txn_id,
                status: order.status,
            });
        }

        let now = self.clock.now();
        if let Some(booking_id) = order.booking_ref.booking_id() {
            self.with_store_retry("cancel_booking", client_txn_id, || {
                self.bookings.cancel_pending(booking_id, now)
            })
            .await
            .map_err(|e| ReconcileError::persistence(client_txn_id, e))?;
        }

        let change = StatusChange::at(now).with_failure_reason("cancelled by customer");
        let transition = self
            .transition(client_txn_id, OrderStatus::Cancelled, change)
            .await?;
        let order = match transition {
            TransitionOutcome::Applied(order) => order,
            TransitionOutcome::Skipped(order) => {
                return Err(ReconcileError::OrderAlreadyFinal {
                    client_txn_id: order.client_txn_id,
                    status: order.status,
                })
            }
        };

        info!(client_txn_id = %client_txn_id, "payment cancelled by customer");
        self.emit(ReconciliationStage::Cancelled, client_txn_id, Some(order.clone()), None);
        Ok(order)
    }

    /// Feeds a pushed status into the same path the poller uses. The order is
    /// found by client id, else by provider id.
    pub async fn handle_provider_callback(
        &self,
        callback: ProviderCallback,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let order = match (&callback.client_txn_id, &callback.provider_txn_id) {
            (Some(client_txn_id), _) => self.load_order(client_txn_id).await?,
            (None, Some(provider_txn_id)) => self
                .orders
                .find_by_provider_txn_id(provider_txn_id)
                .await
                .map_err(|e| ReconcileError::persistence(provider_txn_id, e))?
                .ok_or_else(|| ReconcileError::OrderNotFound {
                    client_txn_id: provider_txn_id.clone(),
                })?,
            (None, None) => {
                return Err(ReconcileError::InvalidCallback {
                    reason: "client_txn_id or provider_txn_id is required".to_string(),
                })
            }
        };

        info!(
            client_txn_id = %order.client_txn_id,
            provider_txn_id = ?callback.provider_txn_id,
            status = %callback.status,
            "provider callback received"
        );

        let update = match GatewayStatus::from_provider(&callback.status) {
            GatewayStatus::Pending => {
                if let Err(e) = self
                    .orders
                    .record_check(&order.client_txn_id, self.clock.now(), callback.raw)
                    .await
                {
                    warn!(client_txn_id = %order.client_txn_id, error = %e, "could not record callback");
                }
                return Ok(ReconcileOutcome::Pending(order));
            }
            GatewayStatus::Completed => StatusUpdate::completed(callback.provider_txn_id),
            GatewayStatus::Failed => {
                StatusUpdate::failed(format!("gateway reported '{}'", callback.status))
                    .with_provider_txn_id(callback.provider_txn_id)
            }
        }
        .with_raw(callback.raw);

        let outcome = self.on_status_update(&order.client_txn_id, update).await?;
        self.detach(&order.client_txn_id);
        Ok(outcome)
    }

    // ------------------------------------------------------------------------
    // Store helpers
    // ------------------------------------------------------------------------

    async fn load_order(&self, client_txn_id: &str) -> Result<PaymentOrder, ReconcileError> {
        self.with_store_retry("load_order", client_txn_id, || {
            self.orders.find_by_client_txn_id(client_txn_id)
        })
        .await
        .map_err(|e| ReconcileError::persistence(client_txn_id, e))?
        .ok_or_else(|| ReconcileError::OrderNotFound {
            client_txn_id: client_txn_id.to_string(),
        })
    }

    async fn transition(
        &self,
        client_txn_id: &str,
        next: OrderStatus,
        change: StatusChange,
    ) -> Result<TransitionOutcome, ReconcileError> {
        self.with_store_retry("update_status", client_txn_id, || {
            self.orders.update_status(client_txn_id, next, change.clone())
        })
        .await
        .map_err(|e| ReconcileError::persistence(client_txn_id, e))
    }

    /// Retries retryable store errors with exponential backoff.
    async fn with_store_retry<T, F, Fut>(
        &self,
        operation: &str,
        client_txn_id: &str,
        mut call: F,
    ) -> Result<T, DatabaseError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DatabaseError>>,
    {
        let max_attempts = self.config.store_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.config.store_backoff * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        client_txn_id = %client_txn_id,
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "store operation failed, retrying"
                    );
                    self.clock.sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn emit(
        &self,
        stage: ReconciliationStage,
        client_txn_id: &str,
        order: Option<PaymentOrder>,
        error: Option<String>,
    ) {
        let event = ReconciliationEvent {
            client_txn_id: client_txn_id.to_string(),
            stage,
            order,
            error,
            at: self.clock.now(),
        };
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_outcomes_map_to_status_updates() {
        let timeout: StatusUpdate = PollOutcome::TimedOut {
            elapsed: Duration::from_secs(600),
            ticks: 119,
        }
        .into();
        assert_eq!(timeout.status, TerminalStatus::Timeout);

        let rejected: StatusUpdate = PollOutcome::Rejected {
            error: GatewayError::invalid_field("txn_date", "Invalid txn_date"),
        }
        .into();
        assert_eq!(rejected.status, TerminalStatus::Failed);
        assert_eq!(rejected.reason.as_deref(), Some("Invalid txn_date"));
    }

    #[test]
    fn only_live_stages_are_non_terminal() {
        assert!(!ReconciliationStage::Polling.is_terminal());
        assert!(!ReconciliationStage::AwaitingPayment.is_terminal());
        assert!(ReconciliationStage::TimedOut.is_terminal());
        assert!(ReconciliationStage::ConflictRefundPending.is_terminal());
        assert!(ReconciliationStage::NeedsSupport.is_terminal());
    }

    #[test]
    fn reconcile_errors_keep_their_http_meaning() {
        let slot: SlotKey = "hallA|2024-06-17|09:00-17:00".parse().expect("valid slot");
        let conflict: AppError = ReconcileError::SlotUnavailable {
            slot,
            held_by: vec![Uuid::new_v4()],
        }
        .into();
        assert_eq!(conflict.status_code(), 409);

        let persistence: AppError = ReconcileError::Persistence {
            client_txn_id: "txn_1".to_string(),
            message: "connection reset".to_string(),
        }
        .into();
        assert_eq!(persistence.status_code(), 500);

        let missing: AppError = ReconcileError::OrderNotFound {
            client_txn_id: "txn_1".to_string(),
        }
        .into();
        assert_eq!(missing.status_code(), 404);
    }

    #[test]
    fn initiate_request_reads_flow_from_json() {
        let request: InitiateRequest = serde_json::from_value(serde_json::json!({
            "amount_minor": 50000,
            "customer": {"name": "Asha", "email": "asha@example.com", "mobile": "9876543210"},
            "flow": "pay_first",
            "slot": "hallA|2024-06-17|09:00-17:00"
        }))
        .expect("valid request");
        assert!(matches!(request.flow, BookingFlow::PayFirst { .. }));
        assert!(request.client_txn_id.is_none());
    }
}
