use crate::database::error::{DatabaseError, DatabaseErrorKind};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid slot '{slot}': {reason}")]
pub struct SlotKeyError {
    pub slot: String,
    pub reason: String,
}

impl From<SlotKeyError> for crate::error::AppError {
    fn from(err: SlotKeyError) -> Self {
        use crate::error::{AppError, AppErrorKind, ValidationError};

        AppError::new(AppErrorKind::Validation(ValidationError::InvalidSlot {
            slot: err.slot,
            reason: err.reason,
        }))
    }
}

/// The bookable thing: a whole study hall, or one seat in it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SlotResource {
    Hall { hall_id: String },
    Seat { hall_id: String, seat_id: String },
}

impl SlotResource {
    pub fn hall_id(&self) -> &str {
        match self {
            SlotResource::Hall { hall_id } | SlotResource::Seat { hall_id, .. } => hall_id,
        }
    }

    /// `hall` or `hall|seat`; equal keys compete for the same time windows.
    pub fn key(&self) -> String {
        match self {
            SlotResource::Hall { hall_id } => hall_id.clone(),
            SlotResource::Seat { hall_id, seat_id } => format!("{}|{}", hall_id, seat_id),
        }
    }
}

/// Resource, day and half-open time window of a booking.
///
/// Text form is `hall|YYYY-MM-DD|HH:MM-HH:MM` or
/// `hall|seat|YYYY-MM-DD|HH:MM-HH:MM`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SlotKey {
    pub resource: SlotResource,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl SlotKey {
    pub fn new(
        resource: SlotResource,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<Self, SlotKeyError> {
        let key = Self {
            resource,
            date,
            start,
            end,
        };
        if start >= end {
            return Err(SlotKeyError {
                slot: key.to_string(),
                reason: "start time must be before end time".to_string(),
            });
        }
        Ok(key)
    }

    /// Same resource on the same day, and `[s1,e1)` meets `[s2,e2)`.
    pub fn overlaps(&self, other: &SlotKey) -> bool {
        self.resource == other.resource
            && self.date == other.date
            && self.start < other.end
            && other.start < self.end
    }

    /// Serializes concurrent finalizations for one resource and day.
    pub fn lock_key(&self) -> String {
        format!("{}|{}", self.resource.key(), self.date.format("%Y-%m-%d"))
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}-{}",
            self.resource.key(),
            self.date.format("%Y-%m-%d"),
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }
}

impl FromStr for SlotKey {
    type Err = SlotKeyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| SlotKeyError {
            slot: value.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = value.trim().split('|').map(str::trim).collect();
        let (resource, date, window) = match parts.as_slice() {
            [hall, date, window] => (
                SlotResource::Hall {
                    hall_id: hall.to_string(),
                },
                *date,
                *window,
            ),
            [hall, seat, date, window] => (
                SlotResource::Seat {
                    hall_id: hall.to_string(),
                    seat_id: seat.to_string(),
                },
                *date,
                *window,
            ),
            _ => return Err(invalid("expected hall|date|HH:MM-HH:MM or hall|seat|date|HH:MM-HH:MM")),
        };

        let empty_id = match &resource {
            SlotResource::Hall { hall_id } => hall_id.is_empty(),
            SlotResource::Seat { hall_id, seat_id } => hall_id.is_empty() || seat_id.is_empty(),
        };
        if empty_id {
            return Err(invalid("hall and seat ids must not be empty"));
        }

        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map_err(|_| invalid("date must be YYYY-MM-DD"))?;
        let (start, end) = window
            .split_once('-')
            .ok_or_else(|| invalid("time window must be HH:MM-HH:MM"))?;
        let start = NaiveTime::parse_from_str(start.trim(), "%H:%M")
            .map_err(|_| invalid("start time must be HH:MM"))?;
        let end = NaiveTime::parse_from_str(end.trim(), "%H:%M")
            .map_err(|_| invalid("end time must be HH:MM"))?;

        SlotKey::new(resource, date, start, end)
    }
}

impl From<SlotKey> for String {
    fn from(value: SlotKey) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for SlotKey {
    type Error = SlotKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    CheckedIn,
    Completed,
    Cancelled,
    /// Paid, but the slot was taken first; the payment needs a refund.
    ConflictFailed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::CheckedIn => "checked_in",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::ConflictFailed => "conflict_failed",
        }
    }

    pub fn from_db_status(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(BookingStatus::Pending),
            "confirmed" => Some(BookingStatus::Confirmed),
            "checked_in" => Some(BookingStatus::CheckedIn),
            "completed" => Some(BookingStatus::Completed),
            "cancelled" => Some(BookingStatus::Cancelled),
            "conflict_failed" => Some(BookingStatus::ConflictFailed),
            _ => None,
        }
    }

    /// Whether a booking in this status blocks overlapping bookings.
    pub fn holds_slot(&self) -> bool {
        matches!(
            self,
            BookingStatus::Pending | BookingStatus::Confirmed | BookingStatus::CheckedIn
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn from_db_status(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(PaymentStatus::Pending),
            "paid" => Some(PaymentStatus::Paid),
            "failed" => Some(PaymentStatus::Failed),
            "refunded" => Some(PaymentStatus::Refunded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub slot: SlotKey,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub amount_minor: i64,
    /// Payment that settled this booking; unique across bookings.
    pub client_txn_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewBooking {
    pub slot: SlotKey,
    pub amount_minor: i64,
    pub at: DateTime<Utc>,
}

/// Everything needed to turn a paid order into a booking.
#[derive(Debug, Clone)]
pub struct FinalizeRequest {
    pub client_txn_id: String,
    pub slot: SlotKey,
    pub amount_minor: i64,
    /// Set for book-then-pay; `None` creates the booking.
    pub booking_id: Option<Uuid>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    Confirmed(Booking),
    /// This payment was finalized before; nothing was written.
    AlreadyFinalized(Booking),
    /// The slot is held by other bookings. For book-then-pay the existing
    /// booking is returned marked `conflict_failed`.
    Conflict {
        booking: Option<Booking>,
        held_by: Vec<Uuid>,
    },
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Creates a `pending` booking; `SlotConflict` if the window is held.
    async fn create_pending(&self, new: NewBooking) -> Result<Booking, DatabaseError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Booking>, DatabaseError>;

    /// Slot-holding bookings on the same resource and day that overlap `slot`.
    async fn list_active_for_slot(&self, slot: &SlotKey) -> Result<Vec<Booking>, DatabaseError>;

    /// Conflict check and booking write as one atomic unit, idempotent per
    /// `client_txn_id`.
    async fn finalize_paid(&self, request: FinalizeRequest)
        -> Result<FinalizeOutcome, DatabaseError>;

    /// Cancels a booking that is still `pending`; `None` if it was not.
    async fn cancel_pending(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<Booking>, DatabaseError>;
}

#[cfg(feature = "database")]
pub use pg::PgBookingRepository;

#[cfg(feature = "database")]
mod pg {
    use super::*;
    use crate::services::conflict_checker::find_conflicts;
    use sqlx::{FromRow, PgPool, Postgres, Transaction};

    const BOOKING_COLUMNS: &str = "id, slot, status, payment_status, amount_minor, \
         client_txn_id, created_at, updated_at";

    #[derive(Debug, FromRow)]
    struct BookingRow {
        id: Uuid,
        slot: String,
        status: String,
        payment_status: String,
        amount_minor: i64,
        client_txn_id: Option<String>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    }

    impl TryFrom<BookingRow> for Booking {
        type Error = DatabaseError;

        fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
            let unknown = |message: String| DatabaseError::new(DatabaseErrorKind::Unknown { message });
            Ok(Booking {
                id: row.id,
                slot: row.slot.parse().map_err(|e: SlotKeyError| unknown(e.to_string()))?,
                status: BookingStatus::from_db_status(&row.status)
                    .ok_or_else(|| unknown(format!("Unknown booking status '{}'", row.status)))?,
                payment_status: PaymentStatus::from_db_status(&row.payment_status).ok_or_else(
                    || unknown(format!("Unknown payment status '{}'", row.payment_status)),
                )?,
                amount_minor: row.amount_minor,
                client_txn_id: row.client_txn_id,
                created_at: row.created_at,
                updated_at: row.updated_at,
            })
        }
    }

    /// Postgres-backed [`BookingStore`]. Writes that claim a slot take a
    /// transaction-scoped advisory lock on the resource and day; the
    /// exclusion constraint on `bookings` backs it up.
    pub struct PgBookingRepository {
        pool: PgPool,
    }

    impl PgBookingRepository {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }

        async fn lock_slot(
            tx: &mut Transaction<'_, Postgres>,
            slot: &SlotKey,
        ) -> Result<(), DatabaseError> {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(slot.lock_key())
                .execute(&mut **tx)
                .await
                .map_err(DatabaseError::from_sqlx)?;
            Ok(())
        }

        async fn holders(
            tx: &mut Transaction<'_, Postgres>,
            slot: &SlotKey,
        ) -> Result<Vec<Booking>, DatabaseError> {
            let sql = format!(
                "SELECT {} FROM bookings
                 WHERE resource_key = $1 AND slot_date = $2
                   AND status IN ('pending', 'confirmed', 'checked_in')",
                BOOKING_COLUMNS
            );
            sqlx::query_as::<_, BookingRow>(&sql)
                .bind(slot.resource.key())
                .bind(slot.date)
                .fetch_all(&mut **tx)
                .await
                .map_err(DatabaseError::from_sqlx)?
                .into_iter()
                .map(Booking::try_from)
                .collect()
        }

        async fn find_by_payment(
            tx: &mut Transaction<'_, Postgres>,
            client_txn_id: &str,
        ) -> Result<Option<Booking>, DatabaseError> {
            let sql = format!(
                "SELECT {} FROM bookings WHERE client_txn_id = $1",
                BOOKING_COLUMNS
            );
            sqlx::query_as::<_, BookingRow>(&sql)
                .bind(client_txn_id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(DatabaseError::from_sqlx)?
                .map(Booking::try_from)
                .transpose()
        }

        async fn set_status(
            tx: &mut Transaction<'_, Postgres>,
            id: Uuid,
            status: BookingStatus,
            payment_status: PaymentStatus,
            client_txn_id: Option<&str>,
            at: DateTime<Utc>,
        ) -> Result<Booking, DatabaseError> {
            let sql = format!(
                "UPDATE bookings
                 SET status = $2, payment_status = $3,
                     client_txn_id = COALESCE($4, client_txn_id), updated_at = $5
                 WHERE id = $1
                 RETURNING {}",
                BOOKING_COLUMNS
            );
            let row = sqlx::query_as::<_, BookingRow>(&sql)
                .bind(id)
                .bind(status.as_str())
                .bind(payment_status.as_str())
                .bind(client_txn_id)
                .bind(at)
                .fetch_one(&mut **tx)
                .await
                .map_err(DatabaseError::from_sqlx)?;
            Booking::try_from(row)
        }

        async fn insert(
            tx: &mut Transaction<'_, Postgres>,
            slot: &SlotKey,
            status: BookingStatus,
            payment_status: PaymentStatus,
            amount_minor: i64,
            client_txn_id: Option<&str>,
            at: DateTime<Utc>,
        ) -> Result<Booking, DatabaseError> {
            let (hall_id, seat_id) = match &slot.resource {
                SlotResource::Hall { hall_id } => (hall_id.as_str(), None),
                SlotResource::Seat { hall_id, seat_id } => (hall_id.as_str(), Some(seat_id.as_str())),
            };
            let sql = format!(
                "INSERT INTO bookings
                 (id, slot, resource_key, hall_id, seat_id, slot_date, start_time, end_time,
                  status, payment_status, amount_minor, client_txn_id, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13)
                 RETURNING {}",
                BOOKING_COLUMNS
            );
            let row = sqlx::query_as::<_, BookingRow>(&sql)
                .bind(Uuid::new_v4())
                .bind(slot.to_string())
                .bind(slot.resource.key())
                .bind(hall_id)
                .bind(seat_id)
                .bind(slot.date)
                .bind(slot.start)
                .bind(slot.end)
                .bind(status.as_str())
                .bind(payment_status.as_str())
                .bind(amount_minor)
                .bind(client_txn_id)
                .bind(at)
                .fetch_one(&mut **tx)
                .await
                .map_err(DatabaseError::from_sqlx)?;
            Booking::try_from(row)
        }
    }

    #[async_trait]
    impl BookingStore for PgBookingRepository {
        async fn create_pending(&self, new: NewBooking) -> Result<Booking, DatabaseError> {
            let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;
            Self::lock_slot(&mut tx, &new.slot).await?;

            let holders = Self::holders(&mut tx, &new.slot).await?;
            if !find_conflicts(&holders, &new.slot, None).is_empty() {
                tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
                return Err(DatabaseError::new(DatabaseErrorKind::SlotConflict {
                    message: new.slot.to_string(),
                }));
            }

            let booking = Self::insert(
                &mut tx,
                &new.slot,
                BookingStatus::Pending,
                PaymentStatus::Pending,
                new.amount_minor,
                None,
                new.at,
            )
            .await?;

            tx.commit().await.map_err(DatabaseError::from_sqlx)?;
            Ok(booking)
        }

        async fn find_by_id(&self, id: Uuid) -> Result<Option<Booking>, DatabaseError> {
            let sql = format!("SELECT {} FROM bookings WHERE id = $1", BOOKING_COLUMNS);
            sqlx::query_as::<_, BookingRow>(&sql)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(DatabaseError::from_sqlx)?
                .map(Booking::try_from)
                .transpose()
        }

        async fn list_active_for_slot(
            &self,
            slot: &SlotKey,
        ) -> Result<Vec<Booking>, DatabaseError> {
            let sql = format!(
                "SELECT {} FROM bookings
                 WHERE resource_key = $1 AND slot_date = $2
                   AND status IN ('pending', 'confirmed', 'checked_in')
                   AND start_time < $4 AND $3 < end_time
                 ORDER BY created_at ASC",
                BOOKING_COLUMNS
            );
            sqlx::query_as::<_, BookingRow>(&sql)
                .bind(slot.resource.key())
                .bind(slot.date)
                .bind(slot.start)
                .bind(slot.end)
                .fetch_all(&self.pool)
                .await
                .map_err(DatabaseError::from_sqlx)?
                .into_iter()
                .map(Booking::try_from)
                .collect()
        }

        async fn finalize_paid(
            &self,
            request: FinalizeRequest,
        ) -> Result<FinalizeOutcome, DatabaseError> {
            let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;
            Self::lock_slot(&mut tx, &request.slot).await?;

            if let Some(existing) = Self::find_by_payment(&mut tx, &request.client_txn_id).await? {
                tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
                return Ok(previous_outcome(existing));
            }

            let holders = Self::holders(&mut tx, &request.slot).await?;
            let held_by = find_conflicts(&holders, &request.slot, request.booking_id);

            let outcome = match request.booking_id {
                Some(booking_id) => {
                    let sql = format!(
                        "SELECT {} FROM bookings WHERE id = $1 FOR UPDATE",
                        BOOKING_COLUMNS
                    );
                    let booking = sqlx::query_as::<_, BookingRow>(&sql)
                        .bind(booking_id)
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(DatabaseError::from_sqlx)?
                        .map(Booking::try_from)
                        .transpose()?
                        .ok_or_else(|| DatabaseError::not_found("Booking", booking_id))?;

                    match settle_action(booking.status, held_by.is_empty()) {
                        SettleAction::Confirm => FinalizeOutcome::Confirmed(
                            Self::set_status(
                                &mut tx,
                                booking_id,
                                BookingStatus::Confirmed,
                                PaymentStatus::Paid,
                                Some(&request.client_txn_id),
                                request.at,
                            )
                            .await?,
                        ),
                        SettleAction::MarkConflict => FinalizeOutcome::Conflict {
                            booking: Some(
                                Self::set_status(
                                    &mut tx,
                                    booking_id,
                                    BookingStatus::ConflictFailed,
                                    PaymentStatus::Paid,
                                    Some(&request.client_txn_id),
                                    request.at,
                                )
                                .await?,
                            ),
                            held_by,
                        },
                        SettleAction::AlreadySettled => FinalizeOutcome::Conflict {
                            booking: Some(booking),
                            held_by,
                        },
                    }
                }
                None if held_by.is_empty() => FinalizeOutcome::Confirmed(
                    Self::insert(
                        &mut tx,
                        &request.slot,
                        BookingStatus::Confirmed,
                        PaymentStatus::Paid,
                        request.amount_minor,
                        Some(&request.client_txn_id),
                        request.at,
                    )
                    .await?,
                ),
                None => FinalizeOutcome::Conflict {
                    booking: None,
                    held_by,
                },
            };

            tx.commit().await.map_err(DatabaseError::from_sqlx)?;
            Ok(outcome)
        }

        async fn cancel_pending(
            &self,
            id: Uuid,
            at: DateTime<Utc>,
        ) -> Result<Option<Booking>, DatabaseError> {
            let sql = format!(
                "UPDATE bookings
                 SET status = 'cancelled', payment_status = 'failed', updated_at = $2
                 WHERE id = $1 AND status = 'pending'
                 RETURNING {}",
                BOOKING_COLUMNS
            );
            sqlx::query_as::<_, BookingRow>(&sql)
                .bind(id)
                .bind(at)
                .fetch_optional(&self.pool)
                .await
                .map_err(DatabaseError::from_sqlx)?
                .map(Booking::try_from)
                .transpose()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SettleAction {
    Confirm,
    MarkConflict,
    /// Booking was already settled by a different payment; leave it alone.
    AlreadySettled,
}

/// Decides what a payment does to an existing booking. A booking cancelled
/// before the money arrived is honoured if its window is still free.
pub(crate) fn settle_action(status: BookingStatus, slot_free: bool) -> SettleAction {
    match status {
        BookingStatus::Pending | BookingStatus::Cancelled if slot_free => SettleAction::Confirm,
        BookingStatus::Pending | BookingStatus::Cancelled => SettleAction::MarkConflict,
        _ => SettleAction::AlreadySettled,
    }
}

/// Outcome reported when the payment already settled a booking earlier.
pub(crate) fn previous_outcome(existing: Booking) -> FinalizeOutcome {
    if existing.status == BookingStatus::ConflictFailed {
        FinalizeOutcome::Conflict {
            booking: Some(existing),
            held_by: Vec::new(),
        }
    } else {
        FinalizeOutcome::AlreadyFinalized(existing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(text: &str) -> SlotKey {
        text.parse().expect("valid slot")
    }

    #[test]
    fn parses_hall_and_seat_slots() {
        let hall = slot("hallA|2024-06-17|09:00-17:00");
        assert_eq!(
            hall.resource,
            SlotResource::Hall {
                hall_id: "hallA".to_string()
            }
        );
        assert_eq!(hall.to_string(), "hallA|2024-06-17|09:00-17:00");

        let seat = slot("hallA|S12|2024-06-17|09:00-13:00");
        assert_eq!(seat.resource.hall_id(), "hallA");
        assert_eq!(seat.resource.key(), "hallA|S12");
        assert_eq!(seat.lock_key(), "hallA|S12|2024-06-17");
    }

    #[test]
    fn rejects_malformed_slots() {
        for raw in [
            "hallA|2024-06-17",
            "hallA|17-06-2024|09:00-17:00",
            "hallA|2024-06-17|17:00-09:00",
            "hallA|2024-06-17|09:00-09:00",
            "|2024-06-17|09:00-10:00",
            "hallA|2024-06-17|9am-5pm",
        ] {
            assert!(raw.parse::<SlotKey>().is_err(), "{} should be rejected", raw);
        }
    }

    #[test]
    fn overlap_is_half_open() {
        let morning = slot("hallA|2024-06-17|09:00-13:00");
        let afternoon = slot("hallA|2024-06-17|13:00-17:00");
        let midday = slot("hallA|2024-06-17|12:00-14:00");
        assert!(!morning.overlaps(&afternoon));
        assert!(morning.overlaps(&midday));
        assert!(afternoon.overlaps(&midday));
    }

    #[test]
    fn overlap_requires_same_resource_and_day() {
        let a = slot("hallA|2024-06-17|09:00-17:00");
        assert!(!a.overlaps(&slot("hallB|2024-06-17|09:00-17:00")));
        assert!(!a.overlaps(&slot("hallA|2024-06-18|09:00-17:00")));
        assert!(!a.overlaps(&slot("hallA|S1|2024-06-17|09:00-17:00")));
    }

    #[test]
    fn only_live_bookings_hold_slots() {
        assert!(BookingStatus::Pending.holds_slot());
        assert!(BookingStatus::Confirmed.holds_slot());
        assert!(BookingStatus::CheckedIn.holds_slot());
        assert!(!BookingStatus::Cancelled.holds_slot());
        assert!(!BookingStatus::Completed.holds_slot());
        assert!(!BookingStatus::ConflictFailed.holds_slot());
    }

    #[test]
    fn settle_action_covers_every_status() {
        assert_eq!(settle_action(BookingStatus::Pending, true), SettleAction::Confirm);
        assert_eq!(settle_action(BookingStatus::Cancelled, true), SettleAction::Confirm);
        assert_eq!(settle_action(BookingStatus::Pending, false), SettleAction::MarkConflict);
        assert_eq!(
            settle_action(BookingStatus::Confirmed, true),
            SettleAction::AlreadySettled
        );
        assert_eq!(
            settle_action(BookingStatus::ConflictFailed, true),
            SettleAction::AlreadySettled
        );
    }

    #[test]
    fn slot_key_serializes_as_text() {
        let key = slot("hallA|S3|2024-06-17|09:00-10:30");
        let json = serde_json::to_value(&key).expect("serialize");
        assert_eq!(json, serde_json::json!("hallA|S3|2024-06-17|09:00-10:30"));
        let back: SlotKey = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, key);
    }
}
