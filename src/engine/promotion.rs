use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;
use ulid::Ulid;

use crate::limits::MAX_PROMOTIONS;
use crate::model::*;
use crate::pricing::PromotionDecision;

use super::txn::Txn;
use super::{Engine, EngineError, observed};

impl Engine {
    pub async fn create_promotion(&self, promotion: Promotion) -> Result<Promotion, EngineError> {
        if promotion.valid_from >= promotion.valid_until {
            return Err(EngineError::InvalidRange(format!(
                "promotion window {} .. {} is empty",
                promotion.valid_from, promotion.valid_until
            )));
        }
        if promotion.amount.is_sign_negative() {
            return Err(EngineError::InvalidRange("promotion amount must not be negative".into()));
        }
        if promotion.used_count > promotion.max_uses {
            return Err(EngineError::LimitExceeded("used_count above max_uses"));
        }
        if self.ledger.promotions.len() >= MAX_PROMOTIONS {
            return Err(EngineError::LimitExceeded("too many promotions"));
        }
        let promotion = &promotion;
        observed(
            "create_promotion",
            self.with_retry("create_promotion", || async move {
                let gate = self.promotion_gate(promotion.id).await?;
                if self.ledger.promotions.contains_key(&promotion.id) {
                    return Err(EngineError::AlreadyExists(promotion.id));
                }
                let mut txn = self.begin().await?;
                txn.hold_gate(gate);
                txn.stage(Event::PromotionCreated {
                    promotion: promotion.clone(),
                });
                txn.commit().await?;
                Ok::<_, EngineError>(promotion.clone())
            }),
        )
        .await
    }

    pub fn promotion(&self, id: Ulid) -> Option<Promotion> {
        self.ledger.promotions.get(&id).map(|p| p.value().clone())
    }

    pub fn usage_for_booking(&self, booking_id: Ulid) -> Option<UsedPromotion> {
        self.ledger.usages.get(&booking_id).map(|u| u.value().clone())
    }

    /// Check a promotion for `user_id` booking `property_id` at `now`.
    ///
    /// Checks run in order: existence, validity window, remaining uses, then
    /// whether the user already holds this promotion on an active booking of
    /// the same property. Only conclusive while the promotion's gate is held.
    pub fn validate_promotion(
        &self,
        promotion_id: Ulid,
        user_id: Ulid,
        property_id: Ulid,
        now: DateTime<Utc>,
    ) -> Result<PromotionDecision, EngineError> {
        let promotion = self
            .promotion(promotion_id)
            .ok_or(EngineError::PromotionNotFound(promotion_id))?;
        if !promotion.is_valid_at(now) {
            return Err(EngineError::PromotionExpired(promotion_id));
        }
        if promotion.remaining_uses() == 0 {
            return Err(EngineError::PromotionExhausted(promotion_id));
        }
        let already_used = self.ledger.usages.iter().any(|u| {
            u.promotion_id == promotion_id
                && u.user_id == user_id
                && u.property_id == property_id
                && self
                    .ledger
                    .bookings
                    .get(&u.booking_id)
                    .is_some_and(|b| b.is_active())
        });
        if already_used {
            return Err(EngineError::PromotionAlreadyUsedByUser {
                promotion_id,
                user_id,
            });
        }
        Ok(PromotionDecision::from_promotion(&promotion))
    }

    /// Stage one use of a promotion: increment-with-ceiling plus the usage row.
    pub(super) fn commit_promotion_use(
        &self,
        txn: &mut Txn<'_>,
        usage: UsedPromotion,
    ) -> Result<(), EngineError> {
        let promotion = self
            .promotion(usage.promotion_id)
            .ok_or(EngineError::PromotionNotFound(usage.promotion_id))?;
        if promotion.remaining_uses() == 0 {
            return Err(EngineError::PromotionExhausted(promotion.id));
        }
        if self.ledger.usages.contains_key(&usage.booking_id) {
            return Err(EngineError::AlreadyExists(usage.booking_id));
        }
        txn.stage(Event::PromotionRedeemed { usage });
        Ok(())
    }

    /// Stage the reversal of a booking's promotion use, if it has one.
    pub(super) fn stage_promotion_release(&self, txn: &mut Txn<'_>, booking_id: Ulid) {
        if let Some(promotion_id) = self.ledger.usages.get(&booking_id).map(|u| u.promotion_id) {
            txn.stage(Event::PromotionReleased {
                promotion_id,
                booking_id,
            });
        }
    }

    /// Serialise redemptions of one promotion, bounded by `lock_wait`.
    pub(super) async fn promotion_gate(&self, id: Ulid) -> Result<OwnedMutexGuard<()>, EngineError> {
        let gate = self.promotion_gates.entry(id).or_default().clone();
        tokio::time::timeout(self.options.lock_wait, gate.lock_owned())
            .await
            .map_err(|_| EngineError::StorageBusy)
    }
}
