use crate::database::booking_repository::SlotKey;
use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::payments::types::{CustomerInfo, UpiIntentLinks};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use uuid::Uuid;

/// Provider ids scanned for in raw payloads must look like ids, nothing else.
pub(crate) fn is_scannable_provider_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 64
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// How far back the raw-payload fallback for provider ids looks.
pub const PROVIDER_ID_SCAN_WINDOW_HOURS: i64 = 48;
pub const PROVIDER_ID_SCAN_LIMIT: i64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    Pending,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 6] = [
        OrderStatus::Created,
        OrderStatus::Pending,
        OrderStatus::Completed,
        OrderStatus::Failed,
        OrderStatus::Timeout,
        OrderStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "created",
            OrderStatus::Pending => "pending",
            OrderStatus::Completed => "completed",
            OrderStatus::Failed => "failed",
            OrderStatus::Timeout => "timeout",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_db_status(value: &str) -> Option<Self> {
        match value {
            "created" => Some(OrderStatus::Created),
            "pending" => Some(OrderStatus::Pending),
            "completed" => Some(OrderStatus::Completed),
            "failed" => Some(OrderStatus::Failed),
            "timeout" => Some(OrderStatus::Timeout),
            "cancelled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Created | OrderStatus::Pending)
    }

    /// `created -> pending`, and any non-terminal status to a terminal one.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        match (self, next) {
            (OrderStatus::Created, OrderStatus::Pending) => true,
            (from, to) if !from.is_terminal() && to.is_terminal() => true,
            _ => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an order pays for: an existing booking, or a placeholder until the
/// booking is created on successful payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum BookingRef {
    Booking(Uuid),
    Placeholder(String),
}

impl BookingRef {
    pub fn placeholder() -> Self {
        BookingRef::Placeholder(format!("tmp-{}", Uuid::new_v4()))
    }

    pub fn booking_id(&self) -> Option<Uuid> {
        match self {
            BookingRef::Booking(id) => Some(*id),
            BookingRef::Placeholder(_) => None,
        }
    }

    pub fn parse(value: &str) -> Result<Self, DatabaseError> {
        if value.starts_with("tmp-") {
            return Ok(BookingRef::Placeholder(value.to_string()));
        }
        Uuid::parse_str(value)
            .map(BookingRef::Booking)
            .map_err(|e| {
                DatabaseError::new(DatabaseErrorKind::Unknown {
                    message: format!("Invalid booking reference '{}': {}", value, e),
                })
            })
    }
}

impl fmt::Display for BookingRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookingRef::Booking(id) => write!(f, "{}", id),
            BookingRef::Placeholder(tmp) => f.write_str(tmp),
        }
    }
}

impl From<BookingRef> for String {
    fn from(value: BookingRef) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for BookingRef {
    type Error = DatabaseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        BookingRef::parse(&value)
    }
}

/// One attempt to pay for a booking through the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentOrder {
    /// Caller-generated idempotency key.
    pub client_txn_id: String,
    /// Gateway-assigned id; absent while the order is `created`.
    pub order_id: Option<String>,
    pub provider_txn_id: Option<String>,
    pub amount_minor: i64,
    pub status: OrderStatus,
    pub booking_ref: BookingRef,
    pub slot: Option<SlotKey>,
    pub customer: CustomerInfo,
    /// Gateway calendar date, `DD-MM-YYYY`.
    pub txn_date: String,
    pub payment_url: Option<String>,
    pub upi_intent: UpiIntentLinks,
    pub refund_required: bool,
    pub failure_reason: Option<String>,
    pub gateway_raw: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

/// Fields that may change together with a status transition.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub at: DateTime<Utc>,
    pub raw_payload: Option<JsonValue>,
    pub provider_txn_id: Option<String>,
    pub failure_reason: Option<String>,
    pub refund_required: bool,
    pub booking_ref: Option<BookingRef>,
}

impl StatusChange {
    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            at,
            raw_payload: None,
            provider_txn_id: None,
            failure_reason: None,
            refund_required: false,
            booking_ref: None,
        }
    }

    pub fn with_raw(mut self, raw: Option<JsonValue>) -> Self {
        self.raw_payload = raw;
        self
    }

    pub fn with_provider_txn_id(mut self, provider_txn_id: Option<String>) -> Self {
        self.provider_txn_id = provider_txn_id;
        self
    }

    pub fn with_failure_reason(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self
    }

    pub fn with_refund_required(mut self) -> Self {
        self.refund_required = true;
        self
    }

    pub fn with_booking(mut self, booking_id: Uuid) -> Self {
        self.booking_ref = Some(BookingRef::Booking(booking_id));
        self
    }

    /// Applies the change to an in-memory copy of the order.
    pub(crate) fn apply(&self, order: &mut PaymentOrder, next: OrderStatus) {
        order.status = next;
        order.updated_at = self.at;
        if let Some(raw) = &self.raw_payload {
            order.gateway_raw = Some(raw.clone());
        }
        if let Some(provider_txn_id) = &self.provider_txn_id {
            order.provider_txn_id = Some(provider_txn_id.clone());
        }
        if let Some(reason) = &self.failure_reason {
            order.failure_reason = Some(reason.clone());
        }
        if let Some(booking_ref) = &self.booking_ref {
            order.booking_ref = booking_ref.clone();
        }
        order.refund_required |= self.refund_required;
    }
}

/// Result of a compare-and-set status update.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(PaymentOrder),
    /// The stored status does not allow the transition; carries the stored order.
    Skipped(PaymentOrder),
}

impl TransitionOutcome {
    pub fn order(&self) -> &PaymentOrder {
        match self {
            TransitionOutcome::Applied(order) | TransitionOutcome::Skipped(order) => order,
        }
    }

    pub fn into_order(self) -> PaymentOrder {
        match self {
            TransitionOutcome::Applied(order) | TransitionOutcome::Skipped(order) => order,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }
}

/// Append-only audit row written with every status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAuditEntry {
    pub client_txn_id: String,
    pub from_status: Option<OrderStatus>,
    pub to_status: OrderStatus,
    pub raw_payload: Option<JsonValue>,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Inserts a new order; `UniqueViolation` if the client transaction id exists.
    async fn create(&self, order: &PaymentOrder) -> Result<PaymentOrder, DatabaseError>;

    /// Upsert by client transaction id. A stored terminal order is never
    /// replaced; the stored row is returned instead.
    async fn save(&self, order: &PaymentOrder) -> Result<PaymentOrder, DatabaseError>;

    async fn find_by_client_txn_id(
        &self,
        client_txn_id: &str,
    ) -> Result<Option<PaymentOrder>, DatabaseError>;

    /// Indexed lookup first, then a bounded scan of recent raw payloads.
    async fn find_by_provider_txn_id(
        &self,
        provider_txn_id: &str,
    ) -> Result<Option<PaymentOrder>, DatabaseError>;

    async fn update_status(
        &self,
        client_txn_id: &str,
        next: OrderStatus,
        change: StatusChange,
    ) -> Result<TransitionOutcome, DatabaseError>;

    /// Attaches a success report that arrived after the order timed out. The
    /// status stays `timeout`; the provider id, payload and refund flag are
    /// written and an audit row is appended. `None` unless the stored order
    /// is `timeout`.
    async fn record_late_payment(
        &self,
        client_txn_id: &str,
        change: StatusChange,
    ) -> Result<Option<PaymentOrder>, DatabaseError>;

    /// Stamps `last_checked_at` and the last seen payload on a live order.
    async fn record_check(
        &self,
        client_txn_id: &str,
        at: DateTime<Utc>,
        raw_payload: Option<JsonValue>,
    ) -> Result<(), DatabaseError>;

    /// Pending orders created at or after `since`, oldest first.
    async fn list_pending(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentOrder>, DatabaseError>;

    /// Pending orders created before `before`, oldest first.
    async fn list_pending_before(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PaymentOrder>, DatabaseError>;

    async fn audit_trail(&self, client_txn_id: &str)
        -> Result<Vec<OrderAuditEntry>, DatabaseError>;
}

#[cfg(feature = "database")]
pub use pg::PgOrderRepository;

#[cfg(feature = "database")]
mod pg {
    use super::*;
    use sqlx::{FromRow, PgPool, Postgres, Transaction};

    const ORDER_COLUMNS: &str = "client_txn_id, order_id, provider_txn_id, amount_minor, status, \
         booking_ref, slot, customer_name, customer_email, customer_mobile, txn_date, \
         payment_url, upi_intent, refund_required, failure_reason, gateway_raw, \
         created_at, updated_at, last_checked_at";

    #[derive(Debug, FromRow)]
    struct PaymentOrderRow {
        client_txn_id: String,
        order_id: Option<String>,
        provider_txn_id: Option<String>,
        amount_minor: i64,
        status: String,
        booking_ref: String,
        slot: Option<String>,
        customer_name: String,
        customer_email: String,
        customer_mobile: String,
        txn_date: String,
        payment_url: Option<String>,
        upi_intent: JsonValue,
        refund_required: bool,
        failure_reason: Option<String>,
        gateway_raw: Option<JsonValue>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        last_checked_at: Option<DateTime<Utc>>,
    }

    impl TryFrom<PaymentOrderRow> for PaymentOrder {
        type Error = DatabaseError;

        fn try_from(row: PaymentOrderRow) -> Result<Self, Self::Error> {
            let status = OrderStatus::from_db_status(&row.status).ok_or_else(|| {
                DatabaseError::new(DatabaseErrorKind::Unknown {
                    message: format!("Unknown order status '{}'", row.status),
                })
            })?;
            let slot = match row.slot {
                Some(text) => Some(text.parse::<SlotKey>().map_err(|e| {
                    DatabaseError::new(DatabaseErrorKind::Unknown {
                        message: e.to_string(),
                    })
                })?),
                None => None,
            };

            Ok(PaymentOrder {
                client_txn_id: row.client_txn_id,
                order_id: row.order_id,
                provider_txn_id: row.provider_txn_id,
                amount_minor: row.amount_minor,
                status,
                booking_ref: BookingRef::parse(&row.booking_ref)?,
                slot,
                customer: CustomerInfo {
                    name: row.customer_name,
                    email: row.customer_email,
                    mobile: row.customer_mobile,
                },
                txn_date: row.txn_date,
                payment_url: row.payment_url,
                upi_intent: serde_json::from_value(row.upi_intent).unwrap_or_default(),
                refund_required: row.refund_required,
                failure_reason: row.failure_reason,
                gateway_raw: row.gateway_raw,
                created_at: row.created_at,
                updated_at: row.updated_at,
                last_checked_at: row.last_checked_at,
            })
        }
    }

    #[derive(Debug, FromRow)]
    struct AuditRow {
        client_txn_id: String,
        from_status: Option<String>,
        to_status: String,
        raw_payload: Option<JsonValue>,
        recorded_at: DateTime<Utc>,
    }

    /// Postgres-backed [`OrderStore`].
    pub struct PgOrderRepository {
        pool: PgPool,
    }

    impl PgOrderRepository {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }

        async fn insert_audit(
            tx: &mut Transaction<'_, Postgres>,
            client_txn_id: &str,
            from: Option<OrderStatus>,
            to: OrderStatus,
            raw: Option<&JsonValue>,
            at: DateTime<Utc>,
        ) -> Result<(), DatabaseError> {
            sqlx::query(
                "INSERT INTO payment_order_events
                 (client_txn_id, from_status, to_status, raw_payload, recorded_at)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(client_txn_id)
            .bind(from.map(|s| s.as_str()))
            .bind(to.as_str())
            .bind(raw)
            .bind(at)
            .execute(&mut **tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
            Ok(())
        }

        fn upsert_sql(on_conflict: &str) -> String {
            format!(
                "INSERT INTO payment_orders ({cols})
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
                 {on_conflict}
                 RETURNING {cols}",
                cols = ORDER_COLUMNS,
                on_conflict = on_conflict
            )
        }

        async fn write_order(
            &self,
            sql: &str,
            order: &PaymentOrder,
        ) -> Result<Option<PaymentOrder>, DatabaseError> {
            let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

            let previous = sqlx::query_scalar::<_, String>(
                "SELECT status FROM payment_orders WHERE client_txn_id = $1 FOR UPDATE",
            )
            .bind(&order.client_txn_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .and_then(|s| OrderStatus::from_db_status(&s));

            let row = sqlx::query_as::<_, PaymentOrderRow>(sql)
                .bind(&order.client_txn_id)
                .bind(&order.order_id)
                .bind(&order.provider_txn_id)
                .bind(order.amount_minor)
                .bind(order.status.as_str())
                .bind(order.booking_ref.to_string())
                .bind(order.slot.as_ref().map(|s| s.to_string()))
                .bind(&order.customer.name)
                .bind(&order.customer.email)
                .bind(&order.customer.mobile)
                .bind(&order.txn_date)
                .bind(&order.payment_url)
                .bind(serde_json::to_value(&order.upi_intent).unwrap_or(JsonValue::Null))
                .bind(order.refund_required)
                .bind(&order.failure_reason)
                .bind(&order.gateway_raw)
                .bind(order.created_at)
                .bind(order.updated_at)
                .bind(order.last_checked_at)
                .fetch_optional(&mut *tx)
                .await
                .map_err(DatabaseError::from_sqlx)?;

            let Some(row) = row else {
                tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
                return Ok(None);
            };

            if previous != Some(order.status) {
                Self::insert_audit(
                    &mut tx,
                    &order.client_txn_id,
                    previous,
                    order.status,
                    order.gateway_raw.as_ref(),
                    order.updated_at,
                )
                .await?;
            }

            tx.commit().await.map_err(DatabaseError::from_sqlx)?;
            Ok(Some(PaymentOrder::try_from(row)?))
        }
    }

    #[async_trait]
    impl OrderStore for PgOrderRepository {
        async fn create(&self, order: &PaymentOrder) -> Result<PaymentOrder, DatabaseError> {
            let sql = Self::upsert_sql("ON CONFLICT (client_txn_id) DO NOTHING");
            self.write_order(&sql, order).await?.ok_or_else(|| {
                DatabaseError::new(DatabaseErrorKind::UniqueViolation {
                    entity: "PaymentOrder".to_string(),
                    message: format!("client_txn_id '{}' already exists", order.client_txn_id),
                })
            })
        }

        async fn save(&self, order: &PaymentOrder) -> Result<PaymentOrder, DatabaseError> {
            let sql = Self::upsert_sql(
                "ON CONFLICT (client_txn_id) DO UPDATE SET
                     order_id = EXCLUDED.order_id,
                     provider_txn_id = COALESCE(EXCLUDED.provider_txn_id, payment_orders.provider_txn_id),
                     status = EXCLUDED.status,
                     booking_ref = EXCLUDED.booking_ref,
                     slot = EXCLUDED.slot,
                     payment_url = EXCLUDED.payment_url,
                     upi_intent = EXCLUDED.upi_intent,
                     refund_required = payment_orders.refund_required OR EXCLUDED.refund_required,
                     failure_reason = EXCLUDED.failure_reason,
                     gateway_raw = COALESCE(EXCLUDED.gateway_raw, payment_orders.gateway_raw),
                     updated_at = EXCLUDED.updated_at,
                     last_checked_at = EXCLUDED.last_checked_at
                 WHERE payment_orders.status IN ('created', 'pending')",
            );
            match self.write_order(&sql, order).await? {
                Some(saved) => Ok(saved),
                None => self
                    .find_by_client_txn_id(&order.client_txn_id)
                    .await?
                    .ok_or_else(|| DatabaseError::not_found("PaymentOrder", &order.client_txn_id)),
            }
        }

        async fn find_by_client_txn_id(
            &self,
            client_txn_id: &str,
        ) -> Result<Option<PaymentOrder>, DatabaseError> {
            let sql = format!(
                "SELECT {} FROM payment_orders WHERE client_txn_id = $1",
                ORDER_COLUMNS
            );
            sqlx::query_as::<_, PaymentOrderRow>(&sql)
                .bind(client_txn_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(DatabaseError::from_sqlx)?
                .map(PaymentOrder::try_from)
                .transpose()
        }

        async fn find_by_provider_txn_id(
            &self,
            provider_txn_id: &str,
        ) -> Result<Option<PaymentOrder>, DatabaseError> {
            let sql = format!(
                "SELECT {} FROM payment_orders WHERE provider_txn_id = $1 LIMIT 1",
                ORDER_COLUMNS
            );
            let indexed = sqlx::query_as::<_, PaymentOrderRow>(&sql)
                .bind(provider_txn_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(DatabaseError::from_sqlx)?;
            if let Some(row) = indexed {
                return PaymentOrder::try_from(row).map(Some);
            }

            if !is_scannable_provider_id(provider_txn_id) {
                return Ok(None);
            }

            let sql = format!(
                "SELECT {} FROM (
                     SELECT {} FROM payment_orders
                     WHERE created_at >= NOW() - make_interval(hours => $2::int)
                     ORDER BY created_at DESC
                     LIMIT $3
                 ) recent
                 WHERE gateway_raw::text LIKE '%' || $1 || '%'
                 ORDER BY created_at DESC
                 LIMIT 1",
                ORDER_COLUMNS, ORDER_COLUMNS
            );
            sqlx::query_as::<_, PaymentOrderRow>(&sql)
                .bind(provider_txn_id)
                .bind(PROVIDER_ID_SCAN_WINDOW_HOURS as i32)
                .bind(PROVIDER_ID_SCAN_LIMIT)
                .fetch_optional(&self.pool)
                .await
                .map_err(DatabaseError::from_sqlx)?
                .map(PaymentOrder::try_from)
                .transpose()
        }

        async fn update_status(
            &self,
            client_txn_id: &str,
            next: OrderStatus,
            change: StatusChange,
        ) -> Result<TransitionOutcome, DatabaseError> {
            let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

            let select = format!(
                "SELECT {} FROM payment_orders WHERE client_txn_id = $1 FOR UPDATE",
                ORDER_COLUMNS
            );
            let current = sqlx::query_as::<_, PaymentOrderRow>(&select)
                .bind(client_txn_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(DatabaseError::from_sqlx)?;

            let current = match current {
                Some(row) => PaymentOrder::try_from(row)?,
                None => {
                    tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
                    return Err(DatabaseError::not_found("PaymentOrder", client_txn_id));
                }
            };

            if !current.status.can_transition_to(next) {
                tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
                return Ok(TransitionOutcome::Skipped(current));
            }

            let update = format!(
                "UPDATE payment_orders
                 SET status = $2,
                     provider_txn_id = COALESCE($3, provider_txn_id),
                     failure_reason = COALESCE($4, failure_reason),
                     refund_required = refund_required OR $5,
                     booking_ref = COALESCE($6, booking_ref),
                     gateway_raw = COALESCE($7, gateway_raw),
                     updated_at = $8
                 WHERE client_txn_id = $1
                 RETURNING {}",
                ORDER_COLUMNS
            );
            let row = sqlx::query_as::<_, PaymentOrderRow>(&update)
                .bind(client_txn_id)
                .bind(next.as_str())
                .bind(&change.provider_txn_id)
                .bind(&change.failure_reason)
                .bind(change.refund_required)
                .bind(change.booking_ref.as_ref().map(|r| r.to_string()))
                .bind(&change.raw_payload)
                .bind(change.at)
                .fetch_one(&mut *tx)
                .await
                .map_err(DatabaseError::from_sqlx)?;

            Self::insert_audit(
                &mut tx,
                client_txn_id,
                Some(current.status),
                next,
                change.raw_payload.as_ref(),
                change.at,
            )
            .await?;

            tx.commit().await.map_err(DatabaseError::from_sqlx)?;
            Ok(TransitionOutcome::Applied(PaymentOrder::try_from(row)?))
        }

        async fn record_late_payment(
            &self,
            client_txn_id: &str,
            change: StatusChange,
        ) -> Result<Option<PaymentOrder>, DatabaseError> {
            let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

            let update = format!(
                "UPDATE payment_orders
                 SET provider_txn_id = COALESCE($2, provider_txn_id),
                     failure_reason = COALESCE($3, failure_reason),
                     refund_required = refund_required OR $4,
                     gateway_raw = COALESCE($5, gateway_raw),
                     updated_at = $6
                 WHERE client_txn_id = $1 AND status = 'timeout'
                 RETURNING {}",
                ORDER_COLUMNS
            );
            let row = sqlx::query_as::<_, PaymentOrderRow>(&update)
                .bind(client_txn_id)
                .bind(&change.provider_txn_id)
                .bind(&change.failure_reason)
                .bind(change.refund_required)
                .bind(&change.raw_payload)
                .bind(change.at)
                .fetch_optional(&mut *tx)
                .await
                .map_err(DatabaseError::from_sqlx)?;

            let Some(row) = row else {
                tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
                return Ok(None);
            };

            Self::insert_audit(
                &mut tx,
                client_txn_id,
                Some(OrderStatus::Timeout),
                OrderStatus::Timeout,
                change.raw_payload.as_ref(),
                change.at,
            )
            .await?;

            tx.commit().await.map_err(DatabaseError::from_sqlx)?;
            PaymentOrder::try_from(row).map(Some)
        }

        async fn record_check(
            &self,
            client_txn_id: &str,
            at: DateTime<Utc>,
            raw_payload: Option<JsonValue>,
        ) -> Result<(), DatabaseError> {
            sqlx::query(
                "UPDATE payment_orders
                 SET last_checked_at = $2, gateway_raw = COALESCE($3, gateway_raw)
                 WHERE client_txn_id = $1 AND status IN ('created', 'pending')",
            )
            .bind(client_txn_id)
            .bind(at)
            .bind(raw_payload)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
            Ok(())
        }

        async fn list_pending(
            &self,
            since: DateTime<Utc>,
            limit: i64,
        ) -> Result<Vec<PaymentOrder>, DatabaseError> {
            let sql = format!(
                "SELECT {} FROM payment_orders
                 WHERE status = 'pending' AND created_at >= $1
                 ORDER BY created_at ASC
                 LIMIT $2",
                ORDER_COLUMNS
            );
            sqlx::query_as::<_, PaymentOrderRow>(&sql)
                .bind(since)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .map_err(DatabaseError::from_sqlx)?
                .into_iter()
                .map(PaymentOrder::try_from)
                .collect()
        }

        async fn list_pending_before(
            &self,
            before: DateTime<Utc>,
            limit: i64,
        ) -> Result<Vec<PaymentOrder>, DatabaseError> {
            let sql = format!(
                "SELECT {} FROM payment_orders
                 WHERE status = 'pending' AND created_at < $1
                 ORDER BY created_at ASC
                 LIMIT $2",
                ORDER_COLUMNS
            );
            sqlx::query_as::<_, PaymentOrderRow>(&sql)
                .bind(before)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .map_err(DatabaseError::from_sqlx)?
                .into_iter()
                .map(PaymentOrder::try_from)
                .collect()
        }

        async fn audit_trail(
            &self,
            client_txn_id: &str,
        ) -> Result<Vec<OrderAuditEntry>, DatabaseError> {
            let rows = sqlx::query_as::<_, AuditRow>(
                "SELECT client_txn_id, from_status, to_status, raw_payload, recorded_at
                 FROM payment_order_events
                 WHERE client_txn_id = $1
                 ORDER BY id ASC",
            )
            .bind(client_txn_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            rows.into_iter()
                .map(|row| {
                    let to_status = OrderStatus::from_db_status(&row.to_status).ok_or_else(|| {
                        DatabaseError::new(DatabaseErrorKind::Unknown {
                            message: format!("Unknown order status '{}'", row.to_status),
                        })
                    })?;
                    Ok(OrderAuditEntry {
                        client_txn_id: row.client_txn_id,
                        from_status: row
                            .from_status
                            .as_deref()
                            .and_then(OrderStatus::from_db_status),
                        to_status,
                        raw_payload: row.raw_payload,
                        recorded_at: row.recorded_at,
                    })
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_never_transition() {
        for from in OrderStatus::ALL.iter().filter(|s| s.is_terminal()) {
            for to in OrderStatus::ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn live_statuses_move_forward_only() {
        assert!(OrderStatus::Created.can_transition_to(OrderStatus::Pending));
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Completed));
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Timeout));
        assert!(OrderStatus::Created.can_transition_to(OrderStatus::Failed));
        assert!(!OrderStatus::Pending.can_transition_to(OrderStatus::Created));
        assert!(!OrderStatus::Pending.can_transition_to(OrderStatus::Pending));
    }

    #[test]
    fn status_round_trips_through_db_text() {
        for status in OrderStatus::ALL {
            assert_eq!(OrderStatus::from_db_status(status.as_str()), Some(status));
        }
        assert_eq!(OrderStatus::from_db_status("paid"), None);
    }

    #[test]
    fn booking_ref_parses_placeholder_and_uuid() {
        let placeholder = BookingRef::placeholder();
        assert!(placeholder.to_string().starts_with("tmp-"));
        assert_eq!(BookingRef::parse(&placeholder.to_string()).ok(), Some(placeholder));

        let id = Uuid::new_v4();
        assert_eq!(
            BookingRef::parse(&id.to_string()).ok(),
            Some(BookingRef::Booking(id))
        );
        assert!(BookingRef::parse("not-a-ref").is_err());
    }

    #[test]
    fn scannable_provider_ids_are_plain_tokens() {
        assert!(is_scannable_provider_id("TXN1"));
        assert!(is_scannable_provider_id("4171_abc-9"));
        assert!(!is_scannable_provider_id(""));
        assert!(!is_scannable_provider_id("%' OR 1=1"));
    }
}
