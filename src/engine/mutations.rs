use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::REFUNDS_TOTAL;
use crate::refund::{RefundResult, compute_refund};

use super::locks::RangeLease;
use super::txn::Txn;
use super::{Engine, EngineError, observed, valid_range};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub property_id: Ulid,
    pub guest_id: Ulid,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub promotion_id: Option<Ulid>,
}

/// Outcome of a cancellation: the cancelled booking (with its refund
/// settlement) and the refund the policy granted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancellationReceipt {
    pub booking: Booking,
    pub refund: RefundResult,
}

/// A single-booking state change, run under the booking's lease.
#[derive(Debug, Clone)]
enum Transition {
    Confirm,
    Deny,
    Cancel,
    /// Cancellation after a declined authorization.
    Void,
    CheckIn,
    CheckOut,
    Complete { today: NaiveDate },
    Delete,
    RecordPayment { payment_ref: String },
    RecordRefund { settlement: RefundSettlement },
}

impl Transition {
    fn action(&self) -> &'static str {
        match self {
            Transition::Confirm => "confirm",
            Transition::Deny => "deny",
            Transition::Cancel => "cancel",
            Transition::Void => "void",
            Transition::CheckIn => "check in",
            Transition::CheckOut => "check out",
            Transition::Complete { .. } => "complete",
            Transition::Delete => "delete",
            Transition::RecordPayment { .. } => "record payment",
            Transition::RecordRefund { .. } => "record refund",
        }
    }

    fn allowed(&self, b: &Booking) -> bool {
        match self {
            Transition::Confirm | Transition::Deny => b.status == BookingStatus::Pending,
            Transition::Cancel | Transition::Void => b.is_active(),
            Transition::CheckIn => {
                b.status == BookingStatus::Confirmed && b.check_in_status == StepStatus::Pending
            }
            Transition::CheckOut => {
                b.status == BookingStatus::Confirmed
                    && b.check_in_status == StepStatus::Completed
                    && b.check_out_status == StepStatus::Pending
            }
            Transition::Complete { today } => {
                b.status == BookingStatus::Confirmed
                    && b.check_out_status == StepStatus::Completed
                    && *today >= b.range.end
            }
            Transition::Delete => true,
            Transition::RecordPayment { .. } => b.is_active() && b.payment_ref.is_none(),
            Transition::RecordRefund { .. } => {
                matches!(b.status, BookingStatus::Cancelled | BookingStatus::Denied)
            }
        }
    }

    /// Whether the booking gives back its nights and promotion use.
    fn releases(&self) -> bool {
        matches!(
            self,
            Transition::Deny | Transition::Cancel | Transition::Void | Transition::Delete
        )
    }
}

fn dates_unavailable(e: EngineError) -> EngineError {
    match e {
        EngineError::RangeUnavailable(range) => EngineError::DatesUnavailable(range),
        other => other,
    }
}

/// Stay length must sit within the listing's bounds; the start night's
/// calendar `min_nights` can raise the minimum.
pub(super) fn check_stay_length(
    listing: &Listing,
    start_night_min: u32,
    range: &DateRange,
) -> Result<(), EngineError> {
    let nights = range.nights();
    let min = listing.min_nights.max(start_night_min).max(1);
    let max = listing.max_nights;
    if nights < min || nights > max {
        return Err(EngineError::InvalidRange(format!(
            "{nights} nights outside allowed {min}..={max}"
        )));
    }
    Ok(())
}

impl Engine {
    // ── Create ───────────────────────────────────────────

    /// Reserve the nights, redeem the promotion and persist a pending booking
    /// as one transaction, then authorize payment.
    pub async fn create_booking(&self, request: BookingRequest) -> Result<Booking, EngineError> {
        observed("create_booking", async {
            let range = valid_range(request.start, request.end)?;
            if range.nights() > MAX_NIGHTS_PER_STAY {
                return Err(EngineError::LimitExceeded("stay too long"));
            }
            let listing = self.listing(request.property_id).await?;
            let booking = self
                .with_retry("create_booking", || {
                    self.try_create_booking(&request, &listing, range)
                })
                .await?;
            self.authorize_payment(booking).await
        })
        .await
    }

    async fn try_create_booking(
        &self,
        request: &BookingRequest,
        listing: &Listing,
        range: DateRange,
    ) -> Result<Booking, EngineError> {
        let property_id = request.property_id;
        let lease = self
            .locks
            .acquire(property_id, range, self.options.lock_wait)
            .await?;
        let gate = match request.promotion_id {
            Some(id) => Some(self.promotion_gate(id).await?),
            None => None,
        };
        let mut txn = self.begin().await?;
        txn.hold_lease(lease);
        if let Some(gate) = gate {
            txn.hold_gate(gate);
        }

        check_stay_length(listing, self.min_nights_at(property_id, range.start), &range)?;
        if !self.range_free(property_id, &range, None) {
            return Err(EngineError::DatesUnavailable(range));
        }
        if self.active_stay_count(property_id) >= MAX_ACTIVE_STAYS_PER_PROPERTY {
            return Err(EngineError::LimitExceeded("too many active bookings on property"));
        }
        let now = Utc::now();
        let decision = request
            .promotion_id
            .map(|id| self.validate_promotion(id, request.guest_id, property_id, now))
            .transpose()?;
        let quote = self.quote_range(listing, &range, decision.as_ref());

        self.stage_reserve(&mut txn, property_id, range, None)
            .map_err(dates_unavailable)?;
        let booking = Booking::pending(
            Ulid::new(),
            property_id,
            request.guest_id,
            range,
            quote.total,
            request.promotion_id,
            now,
        );
        txn.stage(Event::BookingCreated {
            booking: booking.clone(),
        });
        if let Some(decision) = decision {
            self.commit_promotion_use(
                &mut txn,
                UsedPromotion {
                    promotion_id: decision.promotion_id,
                    user_id: request.guest_id,
                    booking_id: booking.id,
                    property_id,
                    discounted_amount: decision.discounted(quote.subtotal),
                    used_at: now,
                },
            )?;
        }
        txn.commit().await?;

        info!(
            booking_id = %booking.id,
            %property_id,
            %range,
            total = %booking.total_amount,
            "booking created"
        );
        Ok(booking)
    }

    /// Authorize the total and attach it to the booking. A decline voids the
    /// booking. An authorization that cannot be attached, because the booking
    /// was cancelled meanwhile or the record did not commit, is refunded in
    /// full and the booking voided.
    async fn authorize_payment(&self, booking: Booking) -> Result<Booking, EngineError> {
        if booking.total_amount <= Decimal::ZERO {
            return Ok(booking);
        }
        let payment_ref = match self.gateway.authorize(booking.total_amount).await {
            Ok(payment_ref) => payment_ref,
            Err(declined) => {
                warn!(booking_id = %booking.id, error = %declined, "authorization failed, voiding booking");
                self.void_booking(booking.id).await?;
                return Err(EngineError::PaymentDeclined(declined.to_string()));
            }
        };

        let recorded = self
            .run_transition(
                "record_payment",
                booking.id,
                Transition::RecordPayment {
                    payment_ref: payment_ref.clone(),
                },
            )
            .await;
        let err = match recorded {
            Ok(booking) => return Ok(booking),
            Err(e) => e,
        };
        warn!(booking_id = %booking.id, error = %err, "payment not recorded, reversing authorization");
        if let RefundSettlement::Failed { reason, .. } = self
            .issue_refund(booking.id, &payment_ref, booking.total_amount)
            .await
        {
            error!(
                booking_id = %booking.id,
                %payment_ref,
                %reason,
                "authorization left standing"
            );
        }
        if let Err(void_err) = self.void_booking(booking.id).await {
            error!(booking_id = %booking.id, error = %void_err, "could not void unpaid booking");
        }
        Err(err)
    }

    /// Cancel a booking whose payment never attached. Already gone or no
    /// longer active counts as done.
    async fn void_booking(&self, id: Ulid) -> Result<(), EngineError> {
        match self.run_transition("void_booking", id, Transition::Void).await {
            Ok(_) | Err(EngineError::InvalidTransition { .. } | EngineError::BookingNotFound(_)) => Ok(()),
            Err(e) => {
                error!(booking_id = %id, error = %e, "could not void booking");
                Err(e)
            }
        }
    }

    // ── Reschedule ───────────────────────────────────────

    /// Move a booking to new dates. The old nights are released and the new
    /// ones reserved in the same transaction, under leases on both ranges.
    /// The total is left as it was.
    pub async fn update_booking_dates(
        &self,
        id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Booking, EngineError> {
        observed("update_booking_dates", async {
            let range = valid_range(start, end)?;
            if range.nights() > MAX_NIGHTS_PER_STAY {
                return Err(EngineError::LimitExceeded("stay too long"));
            }
            let listing = self.listing(self.booking(id)?.property_id).await?;
            self.with_retry("update_booking_dates", || {
                self.try_reschedule(id, range, &listing)
            })
            .await
        })
        .await
    }

    async fn try_reschedule(
        &self,
        id: Ulid,
        range: DateRange,
        listing: &Listing,
    ) -> Result<Booking, EngineError> {
        let (leases, booking) = self.lease_booking(id, Some(range)).await?;
        if !booking.is_active() {
            return Err(EngineError::InvalidTransition {
                id,
                from: booking.status,
                action: "reschedule",
            });
        }
        if booking.range == range {
            return Ok(booking);
        }
        let property_id = booking.property_id;
        check_stay_length(listing, self.min_nights_at(property_id, range.start), &range)?;
        let own = Stay {
            booking_id: id,
            range: booking.range,
        };
        if !self.range_free(property_id, &range, Some(&own)) {
            return Err(EngineError::DatesUnavailable(range));
        }

        let mut txn = self.begin().await?;
        for lease in leases {
            txn.hold_lease(lease);
        }
        self.stage_release(&mut txn, property_id, booking.range);
        self.stage_reserve(&mut txn, property_id, range, Some(&booking.range))
            .map_err(dates_unavailable)?;
        txn.stage(Event::BookingRescheduled {
            id,
            range,
            at: Utc::now(),
        });
        txn.commit().await?;

        info!(booking_id = %id, from = %booking.range, to = %range, "booking rescheduled");
        self.booking(id)
    }

    // ── Cancel / deny / delete ───────────────────────────

    /// Cancel an active booking: release its nights and promotion use, then
    /// refund what the property's policy grants. Money moves only after the
    /// cancellation is committed.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<CancellationReceipt, EngineError> {
        observed("cancel_booking", async {
            let snapshot = self.booking(id)?;
            let policy = self.policy_for(snapshot.property_id).await?;
            let now = Utc::now();
            let booking = self.run_transition("cancel_booking", id, Transition::Cancel).await?;
            let refund = compute_refund(&policy, booking.total_amount, booking.range.start, now);
            info!(
                booking_id = %id,
                percentage = refund.percentage,
                amount = %refund.amount,
                "booking cancelled"
            );
            let booking = self
                .settle_refund(booking, refund.eligible.then_some(refund.amount))
                .await?;
            Ok(CancellationReceipt { booking, refund })
        })
        .await
    }

    /// Host rejects a pending booking. Any authorization is refunded in full.
    pub async fn deny_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        observed("deny_booking", async {
            let booking = self.run_transition("deny_booking", id, Transition::Deny).await?;
            let amount = booking.total_amount;
            self.settle_refund(booking, Some(amount)).await
        })
        .await
    }

    /// Administrative removal. Refused while a payment references the booking.
    pub async fn delete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        observed(
            "delete_booking",
            self.run_transition("delete_booking", id, Transition::Delete),
        )
        .await
    }

    /// Re-issue a refund whose gateway call failed.
    ///
    /// The booking lease is held across the gateway call so two retries cannot
    /// both refund. A log failure after the gateway accepted is not retried.
    pub async fn retry_refund(&self, id: Ulid) -> Result<Booking, EngineError> {
        observed("retry_refund", async {
            let (leases, booking) = self.lease_booking(id, None).await?;
            let (Some(payment_ref), Some(RefundSettlement::Failed { amount, .. })) =
                (booking.payment_ref.as_deref(), booking.refund.as_ref())
            else {
                return Err(EngineError::InvalidTransition {
                    id,
                    from: booking.status,
                    action: "retry refund",
                });
            };
            let settlement = self.issue_refund(id, payment_ref, *amount).await;
            let mut txn = self.begin().await?;
            for lease in leases {
                txn.hold_lease(lease);
            }
            txn.stage(Event::RefundSettled {
                id,
                settlement,
                at: Utc::now(),
            });
            txn.commit().await.map_err(EngineError::exhausted)?;
            self.booking(id)
        })
        .await
    }

    async fn settle_refund(&self, booking: Booking, amount: Option<Money>) -> Result<Booking, EngineError> {
        let settlement = match (
            booking.payment_ref.as_deref(),
            amount.filter(|a| *a > Decimal::ZERO),
        ) {
            (Some(payment_ref), Some(amount)) => self.issue_refund(booking.id, payment_ref, amount).await,
            _ => {
                metrics::counter!(REFUNDS_TOTAL, "outcome" => "not_eligible").increment(1);
                RefundSettlement::NotEligible
            }
        };
        self.run_transition("record_refund", booking.id, Transition::RecordRefund { settlement })
            .await
    }

    async fn issue_refund(&self, booking_id: Ulid, payment_ref: &str, amount: Money) -> RefundSettlement {
        match self.gateway.refund(payment_ref, amount).await {
            Ok(refund_ref) => {
                metrics::counter!(REFUNDS_TOTAL, "outcome" => "issued").increment(1);
                info!(%booking_id, %refund_ref, %amount, "refund issued");
                RefundSettlement::Issued { refund_ref, amount }
            }
            Err(e) => {
                metrics::counter!(REFUNDS_TOTAL, "outcome" => "failed").increment(1);
                warn!(%booking_id, %amount, error = %e, "refund failed");
                RefundSettlement::Failed {
                    amount,
                    reason: e.to_string(),
                }
            }
        }
    }

    // ── Host / stay progress ─────────────────────────────

    pub async fn confirm_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        observed(
            "confirm_booking",
            self.run_transition("confirm_booking", id, Transition::Confirm),
        )
        .await
    }

    pub async fn record_check_in(&self, id: Ulid) -> Result<Booking, EngineError> {
        observed(
            "record_check_in",
            self.run_transition("record_check_in", id, Transition::CheckIn),
        )
        .await
    }

    pub async fn record_check_out(&self, id: Ulid) -> Result<Booking, EngineError> {
        observed(
            "record_check_out",
            self.run_transition("record_check_out", id, Transition::CheckOut),
        )
        .await
    }

    /// Close out a stay once its checkout date has passed and checkout is recorded.
    pub async fn complete_booking(&self, id: Ulid, today: NaiveDate) -> Result<Booking, EngineError> {
        observed(
            "complete_booking",
            self.run_transition("complete_booking", id, Transition::Complete { today }),
        )
        .await
    }

    /// Complete every booking that is due. Returns the ids completed.
    pub async fn complete_due_bookings(&self, today: NaiveDate) -> Vec<Ulid> {
        let mut completed = Vec::new();
        for id in self.due_completions(today) {
            match self.complete_booking(id, today).await {
                Ok(_) => completed.push(id),
                // Changed since it was collected.
                Err(e) => debug!(booking_id = %id, error = %e, "completion skipped"),
            }
        }
        completed
    }

    // ── Shared machinery ─────────────────────────────────

    /// Lease a booking's range, plus `also` when given. Two disjoint ranges
    /// get separate leases taken in date order, so the nights between them
    /// stay free for others. Re-leases if the booking moved while we waited.
    async fn lease_booking(
        &self,
        id: Ulid,
        also: Option<DateRange>,
    ) -> Result<(Vec<RangeLease>, Booking), EngineError> {
        for _ in 0..MAX_LEASE_CHASES {
            let seen = self.booking(id)?;
            let mut wanted = match also {
                Some(r) if r.overlaps(&seen.range) => vec![seen.range.cover(&r)],
                Some(r) => vec![seen.range, r],
                None => vec![seen.range],
            };
            wanted.sort_by_key(|r| r.start);
            let mut leases = Vec::with_capacity(wanted.len());
            for range in wanted {
                leases.push(
                    self.locks
                        .acquire(seen.property_id, range, self.options.lock_wait)
                        .await?,
                );
            }
            let current = self.booking(id)?;
            if leases
                .iter()
                .any(|l| l.covers(current.property_id, &current.range))
            {
                return Ok((leases, current));
            }
            debug!(booking_id = %id, "booking moved while leasing");
        }
        Err(EngineError::StorageBusy)
    }

    async fn run_transition(
        &self,
        op: &'static str,
        id: Ulid,
        transition: Transition,
    ) -> Result<Booking, EngineError> {
        self.with_retry(op, || self.try_transition(id, &transition)).await
    }

    async fn try_transition(&self, id: Ulid, transition: &Transition) -> Result<Booking, EngineError> {
        let (leases, booking) = self.lease_booking(id, None).await?;
        if !transition.allowed(&booking) {
            return Err(EngineError::InvalidTransition {
                id,
                from: booking.status,
                action: transition.action(),
            });
        }
        if matches!(transition, Transition::Delete) && booking.payment_ref.is_some() {
            return Err(EngineError::PaymentReferenced(id));
        }
        let gate = match booking.promotion_id {
            Some(promotion_id) if transition.releases() => Some(self.promotion_gate(promotion_id).await?),
            _ => None,
        };

        let mut txn = self.begin().await?;
        for lease in leases {
            txn.hold_lease(lease);
        }
        if let Some(gate) = gate {
            txn.hold_gate(gate);
        }
        self.stage_transition(&mut txn, transition, &booking, Utc::now());
        txn.commit().await?;

        debug!(booking_id = %id, action = transition.action(), "booking updated");
        match transition {
            Transition::Delete => {
                info!(booking_id = %id, "booking deleted");
                Ok(booking)
            }
            _ => self.booking(id),
        }
    }

    fn stage_transition(&self, txn: &mut Txn<'_>, transition: &Transition, booking: &Booking, now: DateTime<Utc>) {
        let id = booking.id;
        if transition.releases() {
            if booking.is_active() {
                self.stage_release(txn, booking.property_id, booking.range);
            }
            self.stage_promotion_release(txn, id);
        }
        let status = |status| Event::BookingStatusChanged { id, status, at: now };
        let event = match transition {
            Transition::Confirm => status(BookingStatus::Confirmed),
            Transition::Deny => status(BookingStatus::Denied),
            Transition::Cancel | Transition::Void => status(BookingStatus::Cancelled),
            Transition::Complete { .. } => status(BookingStatus::Completed),
            Transition::CheckIn => Event::CheckInRecorded { id, at: now },
            Transition::CheckOut => Event::CheckOutRecorded { id, at: now },
            Transition::Delete => Event::BookingDeleted { id },
            Transition::RecordPayment { payment_ref } => Event::PaymentAuthorized {
                id,
                payment_ref: payment_ref.clone(),
                at: now,
            },
            Transition::RecordRefund { settlement } => Event::RefundSettled {
                id,
                settlement: settlement.clone(),
                at: now,
            },
        };
        txn.stage(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(min: u32, max: u32) -> Listing {
        Listing {
            property_id: Ulid::new(),
            host_id: Ulid::new(),
            price_per_night: Decimal::ONE_HUNDRED,
            min_nights: min,
            max_nights: max,
            fees: Decimal::ZERO,
            cancellation_policy_id: Ulid::new(),
        }
    }

    fn nights(n: u64) -> DateRange {
        let start = NaiveDate::from_ymd_opt(2026, 11, 1).unwrap();
        DateRange::new(start, start.checked_add_days(chrono::Days::new(n)).unwrap())
    }

    #[test]
    fn stay_length_bounds() {
        let l = listing(2, 7);
        assert!(check_stay_length(&l, 1, &nights(1)).is_err());
        assert!(check_stay_length(&l, 1, &nights(2)).is_ok());
        assert!(check_stay_length(&l, 1, &nights(7)).is_ok());
        assert!(check_stay_length(&l, 1, &nights(8)).is_err());
    }

    #[test]
    fn start_night_can_raise_minimum() {
        let l = listing(1, 30);
        assert!(check_stay_length(&l, 3, &nights(2)).is_err());
        assert!(check_stay_length(&l, 3, &nights(3)).is_ok());
    }

    #[test]
    fn transitions_follow_state_machine() {
        let mut b = Booking::pending(
            Ulid::new(),
            Ulid::new(),
            Ulid::new(),
            nights(3),
            Decimal::ONE_HUNDRED,
            None,
            Utc::now(),
        );
        assert!(Transition::Confirm.allowed(&b));
        assert!(!Transition::CheckIn.allowed(&b));
        assert!(Transition::Cancel.allowed(&b));

        b.status = BookingStatus::Confirmed;
        assert!(!Transition::Deny.allowed(&b));
        assert!(Transition::CheckIn.allowed(&b));
        assert!(!Transition::CheckOut.allowed(&b));

        b.check_in_status = StepStatus::Completed;
        b.check_out_status = StepStatus::Completed;
        let before_end = Transition::Complete { today: b.range.start };
        let at_end = Transition::Complete { today: b.range.end };
        assert!(!before_end.allowed(&b));
        assert!(at_end.allowed(&b));

        b.status = BookingStatus::Cancelled;
        for t in [Transition::Confirm, Transition::Cancel, Transition::CheckIn] {
            assert!(!t.allowed(&b), "{} from a terminal state", t.action());
        }
    }
}
