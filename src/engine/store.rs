use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use ulid::Ulid;

use crate::limits::COMPACT_CHUNK_EVENTS;
use crate::model::*;
use crate::observability::ACTIVE_BOOKINGS;

use super::{Engine, SharedPropertyState};

/// Committed state. Only replay and the log writer apply events to it, and
/// the writer only after the record carrying them is durable.
#[derive(Default)]
pub(super) struct Ledger {
    pub(super) properties: DashMap<Ulid, SharedPropertyState>,
    pub(super) bookings: DashMap<Ulid, Booking>,
    pub(super) promotions: DashMap<Ulid, Promotion>,
    /// Promotion uses keyed by booking id.
    pub(super) usages: DashMap<Ulid, UsedPromotion>,
}

impl Ledger {
    /// The property's state, created empty on first touch.
    fn property(&self, id: Ulid) -> SharedPropertyState {
        self.properties
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(PropertyState::new(id))))
            .clone()
    }

    pub(super) fn existing_property(&self, id: Ulid) -> Option<SharedPropertyState> {
        self.properties.get(&id).map(|e| e.value().clone())
    }

    /// Apply one committed event.
    pub(super) fn apply(&self, event: &Event) {
        match event {
            Event::NightsReserved { property_id, range } => self.close_nights(*property_id, *range, None),
            Event::NightsBlocked {
                property_id,
                range,
                reason,
            } => self.close_nights(*property_id, *range, Some(reason)),
            Event::NightsReleased { property_id, range } => {
                let ps = self.property(*property_id);
                let mut ps = ps.write();
                for date in range.dates() {
                    if let Some(day) = ps.calendar.get_mut(&date) {
                        day.is_available = true;
                        day.blocked_reason = None;
                    }
                }
            }
            Event::DayAnnotated {
                property_id,
                date,
                price_override,
                min_nights,
            } => {
                let ps = self.property(*property_id);
                let mut ps = ps.write();
                let day = ps
                    .calendar
                    .entry(*date)
                    .or_insert_with(|| CalendarDay::open(*property_id, *date));
                day.price_override = *price_override;
                day.min_nights = *min_nights;
            }
            Event::DayRestored { day } => {
                self.property(day.property_id)
                    .write()
                    .calendar
                    .insert(day.date, day.clone());
            }
            Event::CalendarPurged { property_id, before } => {
                let ps = self.property(*property_id);
                let mut ps = ps.write();
                let kept = ps.calendar.split_off(before);
                ps.calendar = kept;
            }
            Event::BookingCreated { booking } => self.store_booking(booking.id, Some(booking.clone())),
            Event::BookingRescheduled { id, range, at } => self.touch_booking(*id, *at, |b| b.range = *range),
            Event::BookingStatusChanged { id, status, at } => {
                self.touch_booking(*id, *at, |b| b.status = *status)
            }
            Event::CheckInRecorded { id, at } => {
                self.touch_booking(*id, *at, |b| b.check_in_status = StepStatus::Completed)
            }
            Event::CheckOutRecorded { id, at } => {
                self.touch_booking(*id, *at, |b| b.check_out_status = StepStatus::Completed)
            }
            Event::PaymentAuthorized { id, payment_ref, at } => {
                self.touch_booking(*id, *at, |b| b.payment_ref = Some(payment_ref.clone()))
            }
            Event::RefundSettled { id, settlement, at } => {
                self.touch_booking(*id, *at, |b| b.refund = Some(settlement.clone()))
            }
            Event::BookingDeleted { id } => self.store_booking(*id, None),
            Event::PromotionCreated { promotion } => {
                self.promotions.insert(promotion.id, promotion.clone());
            }
            Event::PromotionRedeemed { usage } => {
                // Counted once per booking.
                if self.usages.insert(usage.booking_id, usage.clone()).is_none()
                    && let Some(mut promotion) = self.promotions.get_mut(&usage.promotion_id)
                {
                    promotion.used_count += 1;
                }
            }
            Event::PromotionReleased {
                promotion_id,
                booking_id,
            } => {
                if self.usages.remove(booking_id).is_some()
                    && let Some(mut promotion) = self.promotions.get_mut(promotion_id)
                {
                    promotion.used_count = promotion.used_count.saturating_sub(1);
                }
            }
            Event::UsageRestored { usage } => {
                self.usages.insert(usage.booking_id, usage.clone());
            }
        }
    }

    fn close_nights(&self, property_id: Ulid, range: DateRange, reason: Option<&String>) {
        let ps = self.property(property_id);
        let mut ps = ps.write();
        for date in range.dates() {
            let day = ps
                .calendar
                .entry(date)
                .or_insert_with(|| CalendarDay::open(property_id, date));
            day.is_available = false;
            if let Some(reason) = reason {
                day.blocked_reason = Some(reason.clone());
            }
        }
    }

    fn touch_booking(&self, id: Ulid, at: DateTime<Utc>, change: impl FnOnce(&mut Booking)) {
        let Some(mut booking) = self.bookings.get(&id).map(|b| b.value().clone()) else {
            return;
        };
        change(&mut booking);
        booking.updated_at = at;
        self.store_booking(id, Some(booking));
    }

    /// Replace (or remove) a booking row and keep the active-stay index in step.
    fn store_booking(&self, id: Ulid, next: Option<Booking>) {
        let prior = match &next {
            Some(booking) => self.bookings.insert(id, booking.clone()),
            None => self.bookings.remove(&id).map(|(_, b)| b),
        };
        if let Some(old) = prior.filter(Booking::is_active) {
            self.property(old.property_id).write().remove_stay(id);
            metrics::gauge!(ACTIVE_BOOKINGS).decrement(1.0);
        }
        if let Some(new) = next.filter(Booking::is_active) {
            self.property(new.property_id).write().insert_stay(Stay {
                booking_id: id,
                range: new.range,
            });
            metrics::gauge!(ACTIVE_BOOKINGS).increment(1.0);
        }
    }

    /// The property an event is announced on, if any. Resolved when the event
    /// is staged, before a deletion removes the row it names.
    pub(super) fn event_property(&self, event: &Event) -> Option<Ulid> {
        match event {
            Event::NightsReserved { property_id, .. }
            | Event::NightsBlocked { property_id, .. }
            | Event::NightsReleased { property_id, .. }
            | Event::DayAnnotated { property_id, .. }
            | Event::CalendarPurged { property_id, .. } => Some(*property_id),
            Event::DayRestored { day } => Some(day.property_id),
            Event::BookingCreated { booking } => Some(booking.property_id),
            Event::BookingRescheduled { id, .. }
            | Event::BookingStatusChanged { id, .. }
            | Event::CheckInRecorded { id, .. }
            | Event::CheckOutRecorded { id, .. }
            | Event::PaymentAuthorized { id, .. }
            | Event::RefundSettled { id, .. }
            | Event::BookingDeleted { id } => self.bookings.get(id).map(|b| b.property_id),
            Event::PromotionCreated { .. } => None,
            Event::PromotionRedeemed { usage } | Event::UsageRestored { usage } => Some(usage.property_id),
            Event::PromotionReleased { booking_id, .. } => {
                self.usages.get(booking_id).map(|u| u.property_id)
            }
        }
    }

    /// Current state as log records: promotions, calendar days, bookings, usages.
    pub(super) fn snapshot_commits(&self) -> Vec<Commit> {
        let mut events = Vec::new();
        for promotion in self.promotions.iter() {
            events.push(Event::PromotionCreated {
                promotion: promotion.value().clone(),
            });
        }
        for entry in self.properties.iter() {
            let ps = entry.value().read();
            events.extend(ps.calendar.values().map(|day| Event::DayRestored { day: day.clone() }));
        }
        for booking in self.bookings.iter() {
            events.push(Event::BookingCreated {
                booking: booking.value().clone(),
            });
        }
        for usage in self.usages.iter() {
            events.push(Event::UsageRestored {
                usage: usage.value().clone(),
            });
        }

        let committed_at = Utc::now();
        events
            .chunks(COMPACT_CHUNK_EVENTS)
            .map(|chunk| Commit {
                txn_id: Ulid::new(),
                committed_at,
                events: chunk.to_vec(),
            })
            .collect()
    }
}

impl Engine {
    pub(super) fn existing_property(&self, id: Ulid) -> Option<SharedPropertyState> {
        self.ledger.existing_property(id)
    }
}
