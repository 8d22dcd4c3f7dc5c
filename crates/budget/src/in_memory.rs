//! In-memory budget engine for tests/dev.
//!
//! One mutex guards the whole ledger, so every operation is a single atomic
//! step exactly like a Redis script. Reservation TTL is enforced lazily: an
//! expired reservation is treated as absent by whichever operation touches
//! it next.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use packflow_core::{Money, RunId, TenantId};

use crate::engine::{BudgetEngine, BudgetError, Reservation, ReserveReceipt, Settlement};

#[derive(Debug, Clone)]
struct StoredReservation {
    amount: Money,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Ledger {
    balances: HashMap<TenantId, Money>,
    reservations: HashMap<(TenantId, RunId), StoredReservation>,
}

/// In-memory ledger with script-equivalent atomicity.
#[derive(Debug)]
pub struct InMemoryBudgetEngine {
    ledger: Mutex<Ledger>,
    reservation_ttl: chrono::Duration,
}

impl InMemoryBudgetEngine {
    pub fn new(reservation_ttl: Duration) -> Self {
        Self {
            ledger: Mutex::new(Ledger::default()),
            reservation_ttl: chrono::Duration::from_std(reservation_ttl)
                .unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Drop reservations whose TTL has passed. The lazy per-operation check
    /// makes this optional; it exists for tests and memory hygiene.
    pub fn purge_expired(&self) {
        let now = Utc::now();
        let mut ledger = self.ledger.lock().unwrap();
        ledger.reservations.retain(|_, r| r.expires_at >= now);
    }

    /// Number of live reservations across all tenants (test observability).
    pub fn open_reservations(&self) -> usize {
        let now = Utc::now();
        let ledger = self.ledger.lock().unwrap();
        ledger
            .reservations
            .values()
            .filter(|r| r.expires_at >= now)
            .count()
    }

    fn live_reservation<'a>(
        ledger: &'a Ledger,
        key: &(TenantId, RunId),
        now: DateTime<Utc>,
    ) -> Option<&'a StoredReservation> {
        ledger
            .reservations
            .get(key)
            .filter(|r| r.expires_at >= now)
    }
}

impl Default for InMemoryBudgetEngine {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

#[async_trait]
impl BudgetEngine for InMemoryBudgetEngine {
    async fn reserve(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        amount: Money,
        soft_limit: Money,
    ) -> Result<ReserveReceipt, BudgetError> {
        let now = Utc::now();
        let mut ledger = self.ledger.lock().unwrap();
        let key = (tenant_id, run_id);

        if let Some(existing) = Self::live_reservation(&ledger, &key, now).map(|r| r.amount) {
            if existing == amount {
                let balance = ledger.balances.get(&tenant_id).copied().unwrap_or(Money::ZERO);
                return Ok(ReserveReceipt { new_balance: balance });
            }
            return Err(BudgetError::DuplicateReservation);
        }

        let balance = ledger.balances.get(&tenant_id).copied().unwrap_or(Money::ZERO);
        let after = balance
            .checked_sub(amount)
            .ok_or_else(|| BudgetError::Storage("balance underflow".to_string()))?;
        if after < soft_limit {
            return Err(BudgetError::Insufficient {
                requested: amount,
                available: balance,
            });
        }

        ledger.balances.insert(tenant_id, after);
        ledger.reservations.insert(
            key,
            StoredReservation {
                amount,
                created_at: now,
                expires_at: now + self.reservation_ttl,
            },
        );

        Ok(ReserveReceipt { new_balance: after })
    }

    async fn settle(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        actual: Money,
    ) -> Result<Settlement, BudgetError> {
        let now = Utc::now();
        let mut ledger = self.ledger.lock().unwrap();
        let key = (tenant_id, run_id);

        let reserved = Self::live_reservation(&ledger, &key, now).map(|r| r.amount);
        let Some(reserved) = reserved else {
            // Expired entries are as good as gone.
            ledger.reservations.remove(&key);
            return Err(BudgetError::NoReservation);
        };

        let charge = actual.clamp(Money::ZERO, reserved);
        let refund = reserved.saturating_sub(charge);

        let balance = ledger.balances.get(&tenant_id).copied().unwrap_or(Money::ZERO);
        let new_balance = balance
            .checked_add(refund)
            .ok_or_else(|| BudgetError::Storage("balance overflow".to_string()))?;

        ledger.balances.insert(tenant_id, new_balance);
        ledger.reservations.remove(&key);

        Ok(Settlement {
            charge,
            refund,
            new_balance,
        })
    }

    async fn get_reservation(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
    ) -> Result<Option<Reservation>, BudgetError> {
        let now = Utc::now();
        let ledger = self.ledger.lock().unwrap();
        Ok(
            Self::live_reservation(&ledger, &(tenant_id, run_id), now).map(|r| Reservation {
                tenant_id,
                run_id,
                amount: r.amount,
                created_at: r.created_at,
            }),
        )
    }

    async fn balance(&self, tenant_id: TenantId) -> Result<Money, BudgetError> {
        let ledger = self.ledger.lock().unwrap();
        Ok(ledger.balances.get(&tenant_id).copied().unwrap_or(Money::ZERO))
    }

    async fn set_balance(&self, tenant_id: TenantId, amount: Money) -> Result<(), BudgetError> {
        let mut ledger = self.ledger.lock().unwrap();
        ledger.balances.insert(tenant_id, amount);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> InMemoryBudgetEngine {
        InMemoryBudgetEngine::default()
    }

    fn micros(n: i64) -> Money {
        Money::from_micros(n)
    }

    #[tokio::test]
    async fn reserve_debits_balance_and_creates_reservation() {
        let engine = engine();
        let tenant = TenantId::new();
        let run = RunId::new();
        engine.set_balance(tenant, micros(10_000_000)).await.unwrap();

        let receipt = engine
            .reserve(tenant, run, micros(1_500_000), Money::ZERO)
            .await
            .unwrap();

        assert_eq!(receipt.new_balance, micros(8_500_000));
        let reservation = engine.get_reservation(tenant, run).await.unwrap().unwrap();
        assert_eq!(reservation.amount, micros(1_500_000));
    }

    #[tokio::test]
    async fn reserve_is_idempotent_for_identical_amount() {
        let engine = engine();
        let tenant = TenantId::new();
        let run = RunId::new();
        engine.set_balance(tenant, micros(10_000_000)).await.unwrap();

        engine
            .reserve(tenant, run, micros(1_000_000), Money::ZERO)
            .await
            .unwrap();
        let replay = engine
            .reserve(tenant, run, micros(1_000_000), Money::ZERO)
            .await
            .unwrap();

        // No second debit.
        assert_eq!(replay.new_balance, micros(9_000_000));
        assert_eq!(engine.open_reservations(), 1);
    }

    #[tokio::test]
    async fn reserve_with_different_amount_is_a_duplicate() {
        let engine = engine();
        let tenant = TenantId::new();
        let run = RunId::new();
        engine.set_balance(tenant, micros(10_000_000)).await.unwrap();

        engine
            .reserve(tenant, run, micros(1_000_000), Money::ZERO)
            .await
            .unwrap();
        let err = engine
            .reserve(tenant, run, micros(2_000_000), Money::ZERO)
            .await
            .unwrap_err();

        assert_eq!(err, BudgetError::DuplicateReservation);
    }

    #[tokio::test]
    async fn insufficient_balance_leaves_no_trace() {
        let engine = engine();
        let tenant = TenantId::new();
        let run = RunId::new();
        engine.set_balance(tenant, micros(50_000)).await.unwrap();

        let err = engine
            .reserve(tenant, run, micros(1_000_000), Money::ZERO)
            .await
            .unwrap_err();

        assert!(matches!(err, BudgetError::Insufficient { .. }));
        assert_eq!(engine.balance(tenant).await.unwrap(), micros(50_000));
        assert!(engine.get_reservation(tenant, run).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn negative_soft_limit_allows_bounded_overdraft() {
        let engine = engine();
        let tenant = TenantId::new();
        let run = RunId::new();
        engine.set_balance(tenant, micros(100_000)).await.unwrap();

        let receipt = engine
            .reserve(tenant, run, micros(500_000), micros(-500_000))
            .await
            .unwrap();

        assert_eq!(receipt.new_balance, micros(-400_000));
    }

    #[tokio::test]
    async fn settle_charges_actual_and_refunds_excess() {
        let engine = engine();
        let tenant = TenantId::new();
        let run = RunId::new();
        engine.set_balance(tenant, micros(10_000_000)).await.unwrap();
        engine
            .reserve(tenant, run, micros(1_500_000), Money::ZERO)
            .await
            .unwrap();

        let settlement = engine.settle(tenant, run, micros(1_000_000)).await.unwrap();

        assert_eq!(settlement.charge, micros(1_000_000));
        assert_eq!(settlement.refund, micros(500_000));
        assert_eq!(settlement.new_balance, micros(9_000_000));
        assert!(engine.get_reservation(tenant, run).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn settle_caps_charge_at_reserved_amount() {
        let engine = engine();
        let tenant = TenantId::new();
        let run = RunId::new();
        engine.set_balance(tenant, micros(10_000_000)).await.unwrap();
        engine
            .reserve(tenant, run, micros(1_000_000), Money::ZERO)
            .await
            .unwrap();

        let settlement = engine.settle(tenant, run, micros(5_000_000)).await.unwrap();

        assert_eq!(settlement.charge, micros(1_000_000));
        assert_eq!(settlement.refund, Money::ZERO);
    }

    #[tokio::test]
    async fn second_settle_loses_the_race() {
        let engine = engine();
        let tenant = TenantId::new();
        let run = RunId::new();
        engine.set_balance(tenant, micros(10_000_000)).await.unwrap();
        engine
            .reserve(tenant, run, micros(1_000_000), Money::ZERO)
            .await
            .unwrap();

        engine.settle(tenant, run, micros(400_000)).await.unwrap();
        let err = engine.settle(tenant, run, micros(400_000)).await.unwrap_err();

        assert_eq!(err, BudgetError::NoReservation);
        // The loser must not have moved any money.
        assert_eq!(engine.balance(tenant).await.unwrap(), micros(9_600_000));
    }

    #[tokio::test]
    async fn refund_zero_undoes_the_reservation() {
        let engine = engine();
        let tenant = TenantId::new();
        let run = RunId::new();
        engine.set_balance(tenant, micros(2_000_000)).await.unwrap();
        engine
            .reserve(tenant, run, micros(1_500_000), Money::ZERO)
            .await
            .unwrap();

        let settlement = engine.refund(tenant, run, Money::ZERO).await.unwrap();

        assert_eq!(settlement.charge, Money::ZERO);
        assert_eq!(settlement.refund, micros(1_500_000));
        assert_eq!(engine.balance(tenant).await.unwrap(), micros(2_000_000));
    }

    #[tokio::test]
    async fn expired_reservation_is_gone() {
        let engine = InMemoryBudgetEngine::new(Duration::ZERO);
        let tenant = TenantId::new();
        let run = RunId::new();
        engine.set_balance(tenant, micros(1_000_000)).await.unwrap();
        engine
            .reserve(tenant, run, micros(500_000), Money::ZERO)
            .await
            .unwrap();

        // TTL of zero: the reservation expires immediately.
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(engine.get_reservation(tenant, run).await.unwrap().is_none());
        assert_eq!(
            engine.settle(tenant, run, micros(100_000)).await.unwrap_err(),
            BudgetError::NoReservation
        );
    }
}
