//! Stay quotes: nightly rates, promotion discount, flat fees.

use rust_decimal::Decimal;
use ulid::Ulid;

use crate::model::{DiscountType, Listing, Money, Promotion};
use crate::refund::round_money;

/// Outcome of promotion validation: the discount to apply to a stay's base amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromotionDecision {
    pub promotion_id: Ulid,
    pub discount_type: DiscountType,
    pub amount: Money,
}

impl PromotionDecision {
    pub fn from_promotion(promotion: &Promotion) -> Self {
        Self {
            promotion_id: promotion.id,
            discount_type: promotion.discount_type,
            amount: promotion.amount,
        }
    }

    /// Base amount after the discount, never below zero.
    pub fn discounted(&self, base: Money) -> Money {
        (base - self.discount_on(base)).max(Decimal::ZERO)
    }

    /// The amount taken off `base`, capped at `base`.
    pub fn discount_on(&self, base: Money) -> Money {
        let raw = match self.discount_type {
            DiscountType::Percentage => {
                let pct = self.amount.clamp(Decimal::ZERO, Decimal::ONE_HUNDRED);
                round_money(base * pct / Decimal::ONE_HUNDRED)
            }
            DiscountType::Fixed => round_money(self.amount.max(Decimal::ZERO)),
        };
        raw.min(base)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub nights: u32,
    /// Sum of nightly rates.
    pub subtotal: Money,
    pub discount: Money,
    pub fees: Money,
    pub total: Money,
}

/// `nightly` yields each night's override, or `None` for the listing's default price.
pub fn quote(
    listing: &Listing,
    nightly: impl IntoIterator<Item = Option<Money>>,
    promotion: Option<&PromotionDecision>,
) -> Quote {
    let mut nights = 0u32;
    let mut subtotal = Decimal::ZERO;
    for rate in nightly {
        nights += 1;
        subtotal += rate.unwrap_or(listing.price_per_night);
    }
    let subtotal = round_money(subtotal);
    let discount = promotion.map_or(Decimal::ZERO, |p| p.discount_on(subtotal));
    let fees = round_money(listing.fees);
    Quote {
        nights,
        subtotal,
        discount,
        fees,
        total: subtotal - discount + fees,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing() -> Listing {
        Listing {
            property_id: Ulid::new(),
            host_id: Ulid::new(),
            price_per_night: Decimal::new(10000, 2),
            min_nights: 1,
            max_nights: 30,
            fees: Decimal::new(2500, 2),
            cancellation_policy_id: Ulid::new(),
        }
    }

    fn decision(discount_type: DiscountType, amount: Money) -> PromotionDecision {
        PromotionDecision {
            promotion_id: Ulid::new(),
            discount_type,
            amount,
        }
    }

    #[test]
    fn default_rates_plus_fees() {
        let q = quote(&listing(), [None, None, None], None);
        assert_eq!(q.nights, 3);
        assert_eq!(q.subtotal, Decimal::new(30000, 2));
        assert_eq!(q.total, Decimal::new(32500, 2));
    }

    #[test]
    fn overrides_replace_default_rate() {
        let q = quote(&listing(), [None, Some(Decimal::new(15000, 2))], None);
        assert_eq!(q.subtotal, Decimal::new(25000, 2));
    }

    #[test]
    fn percentage_discount_applies_to_nights_not_fees() {
        let d = decision(DiscountType::Percentage, Decimal::from(10));
        let q = quote(&listing(), [None, None], Some(&d));
        assert_eq!(q.discount, Decimal::new(2000, 2));
        assert_eq!(q.total, Decimal::new(20500, 2));
    }

    #[test]
    fn fixed_discount_capped_at_subtotal() {
        let d = decision(DiscountType::Fixed, Decimal::from(500));
        let q = quote(&listing(), [None], Some(&d));
        assert_eq!(q.discount, Decimal::new(10000, 2));
        assert_eq!(q.total, Decimal::new(2500, 2));
    }

    #[test]
    fn discounted_never_negative() {
        let d = decision(DiscountType::Fixed, Decimal::from(80));
        assert_eq!(d.discounted(Decimal::from(50)), Decimal::ZERO);
        assert_eq!(d.discounted(Decimal::from(100)), Decimal::from(20));
    }

    #[test]
    fn percentage_over_hundred_is_clamped() {
        let d = decision(DiscountType::Percentage, Decimal::from(150));
        assert_eq!(d.discounted(Decimal::from(40)), Decimal::ZERO);
    }
}
