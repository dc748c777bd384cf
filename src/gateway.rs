use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use thiserror::Error;
use ulid::Ulid;

use crate::model::Money;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("payment declined: {0}")]
    Declined(String),

    #[error("unknown payment reference: {0}")]
    UnknownPayment(String),

    #[error("refund of {requested} exceeds refundable balance {available}")]
    RefundExceedsBalance { requested: Money, available: Money },

    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

/// Opaque money-moving capability. The engine never inspects references.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn authorize(&self, amount: Money) -> Result<String, GatewayError>;

    async fn refund(&self, payment_ref: &str, amount: Money) -> Result<String, GatewayError>;
}

#[derive(Debug, Clone)]
struct SandboxPayment {
    authorized: Money,
    refunded: Money,
}

/// In-process gateway that records payments and can be told to fail.
#[derive(Default)]
pub struct SandboxGateway {
    payments: DashMap<String, SandboxPayment>,
    decline_next: AtomicU32,
    fail_next_refunds: AtomicU32,
}

impl SandboxGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decline the next `n` authorizations.
    pub fn decline_next_authorizations(&self, n: u32) {
        self.decline_next.store(n, Ordering::SeqCst);
    }

    /// Report the gateway as unavailable for the next `n` refunds.
    pub fn fail_next_refunds(&self, n: u32) {
        self.fail_next_refunds.store(n, Ordering::SeqCst);
    }

    pub fn refunded(&self, payment_ref: &str) -> Option<Money> {
        self.payments.get(payment_ref).map(|p| p.refunded)
    }

    pub fn authorized(&self, payment_ref: &str) -> Option<Money> {
        self.payments.get(payment_ref).map(|p| p.authorized)
    }

    pub fn payment_count(&self) -> usize {
        self.payments.len()
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn authorize(&self, amount: Money) -> Result<String, GatewayError> {
        if take_one(&self.decline_next) {
            return Err(GatewayError::Declined("sandbox decline".into()));
        }
        let payment_ref = format!("pay_{}", Ulid::new());
        self.payments.insert(
            payment_ref.clone(),
            SandboxPayment {
                authorized: amount,
                refunded: Decimal::ZERO,
            },
        );
        Ok(payment_ref)
    }

    async fn refund(&self, payment_ref: &str, amount: Money) -> Result<String, GatewayError> {
        if take_one(&self.fail_next_refunds) {
            return Err(GatewayError::Unavailable("sandbox outage".into()));
        }
        let mut payment = self
            .payments
            .get_mut(payment_ref)
            .ok_or_else(|| GatewayError::UnknownPayment(payment_ref.to_string()))?;
        let available = payment.authorized - payment.refunded;
        if amount > available {
            return Err(GatewayError::RefundExceedsBalance {
                requested: amount,
                available,
            });
        }
        payment.refunded += amount;
        Ok(format!("ref_{}", Ulid::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn authorize_then_refund() {
        let gw = SandboxGateway::new();
        let pay = gw.authorize(Decimal::new(20000, 2)).await.unwrap();
        gw.refund(&pay, Decimal::new(5000, 2)).await.unwrap();
        assert_eq!(gw.refunded(&pay), Some(Decimal::new(5000, 2)));

        let err = gw.refund(&pay, Decimal::new(20000, 2)).await.unwrap_err();
        assert!(matches!(err, GatewayError::RefundExceedsBalance { .. }));
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed() {
        let gw = SandboxGateway::new();
        gw.decline_next_authorizations(1);
        assert!(gw.authorize(Decimal::ONE).await.is_err());
        let pay = gw.authorize(Decimal::ONE).await.unwrap();

        gw.fail_next_refunds(1);
        assert!(matches!(
            gw.refund(&pay, Decimal::ONE).await,
            Err(GatewayError::Unavailable(_))
        ));
        assert!(gw.refund(&pay, Decimal::ONE).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_reference_rejected() {
        let gw = SandboxGateway::new();
        let err = gw.refund("pay_missing", Decimal::ONE).await.unwrap_err();
        assert_eq!(err, GatewayError::UnknownPayment("pay_missing".into()));
    }
}
