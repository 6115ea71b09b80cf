//! Slot conflict detection
//!
//! A requested slot conflicts with any booking on the same resource and day
//! whose status still holds the slot and whose window overlaps. Stores run
//! [`find_conflicts`] inside their finalize transaction; [`ConflictChecker`]
//! is the read-only pre-check used before money is requested.

use crate::database::booking_repository::{Booking, BookingStore, SlotKey};
use crate::database::error::DatabaseError;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Ids of bookings among `candidates` that block `slot`, ignoring `exclude`.
pub fn find_conflicts<'a>(
    candidates: impl IntoIterator<Item = &'a Booking>,
    slot: &SlotKey,
    exclude: Option<Uuid>,
) -> Vec<Uuid> {
    candidates
        .into_iter()
        .filter(|booking| Some(booking.id) != exclude)
        .filter(|booking| booking.status.holds_slot())
        .filter(|booking| booking.slot.overlaps(slot))
        .map(|booking| booking.id)
        .collect()
}

#[derive(Clone)]
pub struct ConflictChecker {
    bookings: Arc<dyn BookingStore>,
}

impl ConflictChecker {
    pub fn new(bookings: Arc<dyn BookingStore>) -> Self {
        Self { bookings }
    }

    pub async fn conflicting_bookings(
        &self,
        slot: &SlotKey,
        exclude: Option<Uuid>,
    ) -> Result<Vec<Uuid>, DatabaseError> {
        let active = self.bookings.list_active_for_slot(slot).await?;
        let held_by = find_conflicts(&active, slot, exclude);
        if !held_by.is_empty() {
            debug!(slot = %slot, held_by = ?held_by, "slot is already held");
        }
        Ok(held_by)
    }

    pub async fn has_conflict(
        &self,
        slot: &SlotKey,
        exclude: Option<Uuid>,
    ) -> Result<bool, DatabaseError> {
        Ok(!self.conflicting_bookings(slot, exclude).await?.is_empty())
    }
}
