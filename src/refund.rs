//! Refund calculation for cancelled stays.
//!
//! Everything here is a pure function of its inputs. The coordinator decides
//! whether to move money with the result.

use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use ulid::Ulid;

use crate::model::{CancellationPolicy, Money, PolicyName, RefundTier};

/// Currency precision for every stored amount.
pub const MONEY_DP: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefundResult {
    pub percentage: u8,
    pub amount: Money,
    pub eligible: bool,
    pub days_until_check_in: i64,
}

/// Round to cents, half-up.
pub fn round_money(value: Decimal) -> Money {
    value.round_dp_with_strategy(MONEY_DP, RoundingStrategy::MidpointAwayFromZero)
}

/// Whole days until check-in (00:00 UTC on `check_in`), rounded up.
/// Negative once the check-in instant has passed.
pub fn days_until(check_in: NaiveDate, now: DateTime<Utc>) -> i64 {
    let check_in_at = check_in.and_time(NaiveTime::MIN).and_utc();
    let until = check_in_at.signed_duration_since(now);
    // num_days truncates toward zero, so any remainder above it rounds up.
    let whole = until.num_days();
    if until > TimeDelta::days(whole) {
        whole + 1
    } else {
        whole
    }
}

pub fn compute_refund(
    policy: &CancellationPolicy,
    total_amount: Money,
    check_in: NaiveDate,
    now: DateTime<Utc>,
) -> RefundResult {
    let days = days_until(check_in, now);
    let percentage = match policy.name {
        PolicyName::NonRefundable => 0,
        _ => policy.tier_for(days).map_or(0, |t| t.refund_percentage.min(100)),
    };
    let amount = round_money(total_amount * Decimal::from(percentage) / Decimal::ONE_HUNDRED);
    RefundResult {
        percentage,
        amount,
        eligible: percentage > 0,
        days_until_check_in: days,
    }
}

impl CancellationPolicy {
    /// The tier with the highest threshold not exceeding `days_before`.
    pub fn tier_for(&self, days_before: i64) -> Option<&RefundTier> {
        self.tiers
            .iter()
            .filter(|t| days_before >= t.min_days_before)
            .max_by_key(|t| t.min_days_before)
    }

    /// The marketplace's stock tier tables.
    pub fn standard(id: Ulid, name: PolicyName) -> Self {
        let tiers = match name {
            PolicyName::Flexible => vec![tier(1, 100)],
            PolicyName::Moderate => vec![tier(5, 50), tier(0, 0)],
            PolicyName::Strict => vec![tier(14, 50)],
            PolicyName::NonRefundable => Vec::new(),
        };
        Self { id, name, tiers }
    }
}

fn tier(min_days_before: i64, refund_percentage: u8) -> RefundTier {
    RefundTier {
        min_days_before,
        refund_percentage,
    }
}
