use chrono::{DateTime, NaiveDate, Utc};
use ulid::Ulid;

use crate::model::*;
use crate::pricing::{self, PromotionDecision, Quote};
use crate::refund::{RefundResult, compute_refund};

use super::mutations::check_stay_length;
use super::{Engine, EngineError, valid_range};

impl Engine {
    pub fn get_booking(&self, id: Ulid) -> Option<Booking> {
        self.ledger.bookings.get(&id).map(|b| b.value().clone())
    }

    pub(super) fn booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.get_booking(id).ok_or(EngineError::BookingNotFound(id))
    }

    /// Every booking of a property, by start date.
    pub fn bookings_for_property(&self, property_id: Ulid) -> Vec<Booking> {
        let mut bookings: Vec<Booking> = self
            .ledger
            .bookings
            .iter()
            .filter(|b| b.property_id == property_id)
            .map(|b| b.value().clone())
            .collect();
        bookings.sort_by_key(|b| (b.range.start, b.id));
        bookings
    }

    /// Every booking of a guest, oldest first.
    pub fn bookings_for_guest(&self, guest_id: Ulid) -> Vec<Booking> {
        let mut bookings: Vec<Booking> = self
            .ledger
            .bookings
            .iter()
            .filter(|b| b.guest_id == guest_id)
            .map(|b| b.value().clone())
            .collect();
        bookings.sort_by_key(|b| (b.created_at, b.id));
        bookings
    }

    /// Active stays holding a property's nights, by start date.
    pub fn active_stays(&self, property_id: Ulid) -> Vec<Stay> {
        self.existing_property(property_id)
            .map_or_else(Vec::new, |ps| ps.read().stays.clone())
    }

    pub fn booking_count(&self) -> usize {
        self.ledger.bookings.len()
    }

    pub fn property_count(&self) -> usize {
        self.ledger.properties.len()
    }

    /// Price a prospective stay without reserving anything.
    pub async fn quote_stay(
        &self,
        property_id: Ulid,
        guest_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        promotion_id: Option<Ulid>,
    ) -> Result<Quote, EngineError> {
        let range = valid_range(start, end)?;
        let listing = self.listing(property_id).await?;
        check_stay_length(&listing, self.min_nights_at(property_id, start), &range)?;
        let decision = promotion_id
            .map(|id| self.validate_promotion(id, guest_id, property_id, Utc::now()))
            .transpose()?;
        Ok(self.quote_range(&listing, &range, decision.as_ref()))
    }

    /// What cancelling `booking_id` at `now` would refund. Changes nothing.
    pub async fn compute_refund_preview(
        &self,
        booking_id: Ulid,
        now: DateTime<Utc>,
    ) -> Result<RefundResult, EngineError> {
        let booking = self.booking(booking_id)?;
        if !booking.is_active() {
            return Err(EngineError::InvalidTransition {
                id: booking_id,
                from: booking.status,
                action: "cancel",
            });
        }
        let policy = self.policy_for(booking.property_id).await?;
        Ok(compute_refund(
            &policy,
            booking.total_amount,
            booking.range.start,
            now,
        ))
    }

    /// Confirmed bookings whose checkout is recorded and whose last night is behind `today`.
    pub fn due_completions(&self, today: NaiveDate) -> Vec<Ulid> {
        self.ledger.bookings
            .iter()
            .filter(|b| {
                b.status == BookingStatus::Confirmed
                    && b.check_out_status == StepStatus::Completed
                    && b.range.end <= today
            })
            .map(|b| b.id)
            .collect()
    }

    // ── Catalog lookups ──────────────────────────────────

    pub(super) async fn listing(&self, property_id: Ulid) -> Result<Listing, EngineError> {
        self.catalog
            .listing(property_id)
            .await
            .ok_or(EngineError::PropertyNotFound(property_id))
    }

    pub(super) async fn policy_for(&self, property_id: Ulid) -> Result<CancellationPolicy, EngineError> {
        let listing = self.listing(property_id).await?;
        self.catalog
            .cancellation_policy(listing.cancellation_policy_id)
            .await
            .ok_or(EngineError::PolicyNotFound(listing.cancellation_policy_id))
    }

    // ── Calendar-derived pricing ─────────────────────────

    pub(super) fn min_nights_at(&self, property_id: Ulid, date: NaiveDate) -> u32 {
        self.existing_property(property_id)
            .and_then(|ps| ps.read().calendar.get(&date).map(|d| d.min_nights))
            .unwrap_or(1)
    }

    pub(super) fn active_stay_count(&self, property_id: Ulid) -> usize {
        self.existing_property(property_id)
            .map_or(0, |ps| ps.read().stays.len())
    }

    pub(super) fn quote_range(
        &self,
        listing: &Listing,
        range: &DateRange,
        promotion: Option<&PromotionDecision>,
    ) -> Quote {
        let overrides: Vec<Option<Money>> = match self.existing_property(listing.property_id) {
            Some(ps) => {
                let ps = ps.read();
                range
                    .dates()
                    .map(|d| ps.calendar.get(&d).and_then(|day| day.price_override))
                    .collect()
            }
            None => range.dates().map(|_| None).collect(),
        };
        pricing::quote(listing, overrides, promotion)
    }
}
