use chrono::{Days, NaiveDate};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::txn::Txn;
use super::{Engine, EngineError, observed, valid_range};

// ── Calendar checks ──────────────────────────────────────

/// True when `range` is free on both sources of truth: every night is open in
/// the calendar ledger and no active stay overlaps. Nights and the stay of
/// `own` (a booking being moved) do not count against it.
pub fn range_is_free(ps: &PropertyState, range: &DateRange, own: Option<&Stay>) -> bool {
    let is_own_night = |date: NaiveDate| own.is_some_and(|s| s.range.contains(date));
    let calendar_open = range.dates().all(|d| ps.is_night_open(d) || is_own_night(d));
    let no_stay = ps
        .overlapping(range)
        .all(|s| own.is_some_and(|o| o.booking_id == s.booking_id));
    calendar_open && no_stay
}

/// Every day of `range`, with defaults filled in where no record exists.
pub fn materialize(ps: &PropertyState, range: &DateRange) -> Vec<CalendarDay> {
    range
        .dates()
        .map(|date| {
            ps.calendar
                .get(&date)
                .cloned()
                .unwrap_or_else(|| CalendarDay::open(ps.id, date))
        })
        .collect()
}

fn window(start: NaiveDate, end: NaiveDate) -> Result<DateRange, EngineError> {
    let range = valid_range(start, end)?;
    if i64::from(range.nights()) > MAX_CALENDAR_WINDOW_DAYS {
        return Err(EngineError::LimitExceeded("calendar window too wide"));
    }
    Ok(range)
}

impl Engine {
    pub fn is_range_available(
        &self,
        property_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<bool, EngineError> {
        let range = window(start, end)?;
        Ok(self.range_free(property_id, &range, None))
    }

    pub(super) fn range_free(&self, property_id: Ulid, range: &DateRange, own: Option<&Stay>) -> bool {
        match self.existing_property(property_id) {
            Some(ps) => range_is_free(&ps.read(), range, own),
            None => true,
        }
    }

    /// Mark every night of `range` unavailable.
    pub async fn reserve_range(
        &self,
        property_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<(), EngineError> {
        let range = window(start, end)?;
        observed(
            "reserve_range",
            self.with_retry("reserve_range", || async move {
                let lease = self
                    .locks
                    .acquire(property_id, range, self.options.lock_wait)
                    .await?;
                let mut txn = self.begin().await?;
                txn.hold_lease(lease);
                self.stage_reserve(&mut txn, property_id, range, None)?;
                txn.commit().await.map(drop)
            }),
        )
        .await
    }

    /// Mark `range` available again. Releasing open nights is a no-op.
    pub async fn release_range(
        &self,
        property_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<(), EngineError> {
        let range = window(start, end)?;
        observed(
            "release_range",
            self.with_retry("release_range", || async move {
                let lease = self
                    .locks
                    .acquire(property_id, range, self.options.lock_wait)
                    .await?;
                let mut txn = self.begin().await?;
                txn.hold_lease(lease);
                self.stage_release(&mut txn, property_id, range);
                txn.commit().await.map(drop)
            }),
        )
        .await
    }

    /// Host block: reserve with a reason. Fails if a night is taken or an
    /// active booking overlaps.
    pub async fn block_dates(
        &self,
        property_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        reason: String,
    ) -> Result<(), EngineError> {
        let range = window(start, end)?;
        if reason.len() > MAX_BLOCK_REASON_LEN {
            return Err(EngineError::LimitExceeded("block reason too long"));
        }
        let reason = &reason;
        observed(
            "block_dates",
            self.with_retry("block_dates", || async move {
                let lease = self
                    .locks
                    .acquire(property_id, range, self.options.lock_wait)
                    .await?;
                if !self.range_free(property_id, &range, None) {
                    return Err(EngineError::RangeUnavailable(range));
                }
                let mut txn = self.begin().await?;
                txn.hold_lease(lease);
                txn.stage(Event::NightsBlocked {
                    property_id,
                    range,
                    reason: reason.clone(),
                });
                txn.commit().await.map(drop)
            }),
        )
        .await
    }

    /// Set a night's price override and minimum stay length.
    pub async fn annotate_day(
        &self,
        property_id: Ulid,
        date: NaiveDate,
        price_override: Option<Money>,
        min_nights: u32,
    ) -> Result<(), EngineError> {
        if min_nights == 0 {
            return Err(EngineError::InvalidRange("min_nights must be at least 1".into()));
        }
        if price_override.is_some_and(|p| p.is_sign_negative()) {
            return Err(EngineError::InvalidRange("price override must not be negative".into()));
        }
        let night = date
            .checked_add_days(Days::new(1))
            .and_then(|next| DateRange::try_new(date, next))
            .ok_or_else(|| EngineError::InvalidRange(format!("no night after {date}")))?;
        observed(
            "annotate_day",
            self.with_retry("annotate_day", || async move {
                let lease = self
                    .locks
                    .acquire(property_id, night, self.options.lock_wait)
                    .await?;
                let mut txn = self.begin().await?;
                txn.hold_lease(lease);
                txn.stage(Event::DayAnnotated {
                    property_id,
                    date,
                    price_override,
                    min_nights,
                });
                txn.commit().await.map(drop)
            }),
        )
        .await
    }

    /// Latest date with an explicit available record.
    pub fn last_available_date(&self, property_id: Ulid) -> Option<NaiveDate> {
        self.existing_property(property_id)
            .and_then(|ps| ps.read().last_available_date())
    }

    pub fn calendar(
        &self,
        property_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CalendarDay>, EngineError> {
        let range = window(start, end)?;
        Ok(match self.existing_property(property_id) {
            Some(ps) => materialize(&ps.read(), &range),
            None => materialize(&PropertyState::new(property_id), &range),
        })
    }

    /// Administrative cleanup: drop calendar records dated before `before`.
    /// Returns how many records were removed.
    pub async fn purge_calendar_before(
        &self,
        property_id: Ulid,
        before: NaiveDate,
    ) -> Result<usize, EngineError> {
        let Some(history) = DateRange::try_new(NaiveDate::MIN, before) else {
            return Ok(0);
        };
        observed(
            "purge_calendar",
            self.with_retry("purge_calendar", || async move {
                let lease = self
                    .locks
                    .acquire(property_id, history, self.options.lock_wait)
                    .await?;
                let stale = self
                    .existing_property(property_id)
                    .map_or(0, |ps| ps.read().calendar.range(..before).count());
                if stale == 0 {
                    return Ok(0);
                }
                let mut txn = self.begin().await?;
                txn.hold_lease(lease);
                txn.stage(Event::CalendarPurged {
                    property_id,
                    before,
                });
                txn.commit().await?;
                tracing::info!(%property_id, %before, removed = stale, "purged calendar history");
                Ok::<_, EngineError>(stale)
            }),
        )
        .await
    }

    // ── Staging helpers (caller holds the lease) ─────────

    /// Re-check the calendar under the transaction, then stage the reservation.
    /// Nights of `vacated`, released earlier in the same transaction, count as
    /// open.
    pub(super) fn stage_reserve(
        &self,
        txn: &mut Txn<'_>,
        property_id: Ulid,
        range: DateRange,
        vacated: Option<&DateRange>,
    ) -> Result<(), EngineError> {
        debug_assert!(txn.holds_lease_for(property_id, &range));
        let open = self.existing_property(property_id).is_none_or(|ps| {
            let ps = ps.read();
            range
                .dates()
                .all(|d| ps.is_night_open(d) || vacated.is_some_and(|v| v.contains(d)))
        });
        if !open {
            return Err(EngineError::RangeUnavailable(range));
        }
        txn.stage(Event::NightsReserved { property_id, range });
        Ok(())
    }

    /// Stage a release when any night of `range` is closed.
    pub(super) fn stage_release(&self, txn: &mut Txn<'_>, property_id: Ulid, range: DateRange) {
        let any_closed = self.existing_property(property_id).is_some_and(|ps| {
            let ps = ps.read();
            range.dates().any(|d| !ps.is_night_open(d))
        });
        if any_closed {
            txn.stage(Event::NightsReleased { property_id, range });
        }
    }
}
