use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Currency amount, two decimal places at rest.
pub type Money = Decimal;

/// Half-open range of nights `[start, end)`. `end` is the checkout date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start < end, "DateRange start must be before end");
        Self { start, end }
    }

    /// `None` for empty or inverted ranges.
    pub fn try_new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn nights(&self) -> u32 {
        self.end.signed_duration_since(self.start).num_days() as u32
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }

    /// Smallest range covering both.
    pub fn cover(&self, other: &DateRange) -> DateRange {
        DateRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Every night in the range, in order.
    pub fn dates(self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d < end)
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Explicit calendar record. A missing record means "open at the default price".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarDay {
    pub property_id: Ulid,
    pub date: NaiveDate,
    pub is_available: bool,
    pub price_override: Option<Money>,
    pub min_nights: u32,
    pub blocked_reason: Option<String>,
}

impl CalendarDay {
    pub fn open(property_id: Ulid, date: NaiveDate) -> Self {
        Self {
            property_id,
            date,
            is_available: true,
            price_override: None,
            min_nights: 1,
            blocked_reason: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Denied,
    Cancelled,
    Completed,
}

impl BookingStatus {
    /// Active bookings hold their nights on the calendar.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

/// Check-in / check-out progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Pending,
    Completed,
}

/// What happened to the money after a cancellation or denial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundSettlement {
    Issued { refund_ref: String, amount: Money },
    NotEligible,
    Failed { amount: Money, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub property_id: Ulid,
    pub guest_id: Ulid,
    pub range: DateRange,
    pub status: BookingStatus,
    pub check_in_status: StepStatus,
    pub check_out_status: StepStatus,
    pub total_amount: Money,
    pub promotion_id: Option<Ulid>,
    pub payment_ref: Option<String>,
    pub refund: Option<RefundSettlement>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn pending(
        id: Ulid,
        property_id: Ulid,
        guest_id: Ulid,
        range: DateRange,
        total_amount: Money,
        promotion_id: Option<Ulid>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            property_id,
            guest_id,
            range,
            status: BookingStatus::Pending,
            check_in_status: StepStatus::Pending,
            check_out_status: StepStatus::Pending,
            total_amount,
            promotion_id,
            payment_ref: None,
            refund: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// Read-only property metadata supplied by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub property_id: Ulid,
    pub host_id: Ulid,
    pub price_per_night: Money,
    pub min_nights: u32,
    pub max_nights: u32,
    /// Flat per-stay fees (cleaning, service).
    pub fees: Money,
    pub cancellation_policy_id: Ulid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyName {
    Flexible,
    Moderate,
    Strict,
    NonRefundable,
}

/// Refund percentage granted when cancelling at least `min_days_before` days ahead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundTier {
    pub min_days_before: i64,
    pub refund_percentage: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationPolicy {
    pub id: Ulid,
    pub name: PolicyName,
    pub tiers: Vec<RefundTier>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountType {
    Percentage,
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promotion {
    pub id: Ulid,
    pub discount_type: DiscountType,
    /// Percent (0–100) or a fixed currency amount, depending on `discount_type`.
    pub amount: Money,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub max_uses: u32,
    pub used_count: u32,
}

impl Promotion {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_from <= now && now < self.valid_until
    }

    pub fn remaining_uses(&self) -> u32 {
        self.max_uses.saturating_sub(self.used_count)
    }
}

/// "This user used this promotion for this booking." Unique per booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsedPromotion {
    pub promotion_id: Ulid,
    pub user_id: Ulid,
    pub booking_id: Ulid,
    pub property_id: Ulid,
    pub discounted_amount: Money,
    pub used_at: DateTime<Utc>,
}

/// An active booking's hold on a property's nights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stay {
    pub booking_id: Ulid,
    pub range: DateRange,
}

/// Per-property calendar ledger plus the index of active stays.
#[derive(Debug, Clone)]
pub struct PropertyState {
    pub id: Ulid,
    pub calendar: BTreeMap<NaiveDate, CalendarDay>,
    /// Active stays, sorted by `range.start`.
    pub stays: Vec<Stay>,
}

impl PropertyState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            calendar: BTreeMap::new(),
            stays: Vec::new(),
        }
    }

    /// True when the night has no record or an available one.
    pub fn is_night_open(&self, date: NaiveDate) -> bool {
        self.calendar.get(&date).is_none_or(|d| d.is_available)
    }

    pub fn insert_stay(&mut self, stay: Stay) {
        let pos = self
            .stays
            .binary_search_by_key(&stay.range.start, |s| s.range.start)
            .unwrap_or_else(|e| e);
        self.stays.insert(pos, stay);
    }

    pub fn remove_stay(&mut self, booking_id: Ulid) -> Option<Stay> {
        let pos = self.stays.iter().position(|s| s.booking_id == booking_id)?;
        Some(self.stays.remove(pos))
    }

    /// Stays overlapping `query`. Stays starting at or after `query.end` are skipped by binary search.
    pub fn overlapping(&self, query: &DateRange) -> impl Iterator<Item = &Stay> {
        let right_bound = self.stays.partition_point(|s| s.range.start < query.end);
        self.stays[..right_bound]
            .iter()
            .filter(move |s| s.range.end > query.start)
    }

    pub fn last_available_date(&self) -> Option<NaiveDate> {
        self.calendar
            .values()
            .rev()
            .find(|d| d.is_available)
            .map(|d| d.date)
    }
}

/// The event types — flat, no nesting. Grouped into a `Commit` per transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    NightsReserved {
        property_id: Ulid,
        range: DateRange,
    },
    NightsBlocked {
        property_id: Ulid,
        range: DateRange,
        reason: String,
    },
    NightsReleased {
        property_id: Ulid,
        range: DateRange,
    },
    DayAnnotated {
        property_id: Ulid,
        date: NaiveDate,
        price_override: Option<Money>,
        min_nights: u32,
    },
    DayRestored {
        day: CalendarDay,
    },
    CalendarPurged {
        property_id: Ulid,
        before: NaiveDate,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingRescheduled {
        id: Ulid,
        range: DateRange,
        at: DateTime<Utc>,
    },
    BookingStatusChanged {
        id: Ulid,
        status: BookingStatus,
        at: DateTime<Utc>,
    },
    CheckInRecorded {
        id: Ulid,
        at: DateTime<Utc>,
    },
    CheckOutRecorded {
        id: Ulid,
        at: DateTime<Utc>,
    },
    PaymentAuthorized {
        id: Ulid,
        payment_ref: String,
        at: DateTime<Utc>,
    },
    RefundSettled {
        id: Ulid,
        settlement: RefundSettlement,
        at: DateTime<Utc>,
    },
    BookingDeleted {
        id: Ulid,
    },
    PromotionCreated {
        promotion: Promotion,
    },
    PromotionRedeemed {
        usage: UsedPromotion,
    },
    PromotionReleased {
        promotion_id: Ulid,
        booking_id: Ulid,
    },
    UsageRestored {
        usage: UsedPromotion,
    },
}

/// One write-ahead-log record: every event of a transaction, applied all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub txn_id: Ulid,
    pub committed_at: DateTime<Utc>,
    pub events: Vec<Event>,
}
