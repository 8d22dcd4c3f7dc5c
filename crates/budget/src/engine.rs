//! Budget engine trait and operation result types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use packflow_core::{Money, RunId, TenantId};

/// Budget engine error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BudgetError {
    /// Reserving would take the balance below the tenant's soft limit.
    /// No state was mutated.
    #[error("insufficient budget: requested {requested}, available {available}")]
    Insufficient { requested: Money, available: Money },

    /// A reservation for this run already exists with a different amount.
    #[error("run already reserved with a different amount")]
    DuplicateReservation,

    /// No reservation exists for this run. For settle/refund this is the
    /// race-detection witness: exactly one caller ever gets past it.
    #[error("no reservation found for run")]
    NoReservation,

    /// Ledger storage failure (connection, script, serialization).
    #[error("ledger storage error: {0}")]
    Storage(String),
}

/// A live reservation: money locked for one run, pending settle or refund.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub tenant_id: TenantId,
    pub run_id: RunId,
    pub amount: Money,
    pub created_at: DateTime<Utc>,
}

/// Result of a successful reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReserveReceipt {
    pub new_balance: Money,
}

/// Result of a successful settle or refund.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    /// What the tenant was actually charged (`min(requested, reserved)`).
    pub charge: Money,
    /// The part of the reservation returned to the balance.
    pub refund: Money,
    pub new_balance: Money,
}

/// Atomic money operations on the per-tenant ledger.
///
/// Implementations must make every method a single atomic step: concurrent
/// callers observe either none or all of an operation's effects.
#[async_trait]
pub trait BudgetEngine: Send + Sync {
    /// Lock `amount` for `run`, debiting the tenant balance.
    ///
    /// Fails with [`BudgetError::Insufficient`] when
    /// `balance - amount < soft_limit` (the soft limit is zero or negative;
    /// negative allows bounded overdraft). Re-reserving the same
    /// `(tenant, run, amount)` is a no-op returning the current balance;
    /// the same run with a different amount is [`BudgetError::DuplicateReservation`].
    async fn reserve(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        amount: Money,
        soft_limit: Money,
    ) -> Result<ReserveReceipt, BudgetError>;

    /// Consume the reservation, charging `min(actual, reserved)` and
    /// crediting the remainder back to the balance.
    ///
    /// NOT idempotent: if the reservation is gone (already settled, already
    /// refunded, or expired) this fails with [`BudgetError::NoReservation`].
    async fn settle(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        actual: Money,
    ) -> Result<Settlement, BudgetError>;

    /// Failure-path settle: charge only the minimum fee and return the rest.
    ///
    /// Same semantics and same error surface as [`BudgetEngine::settle`];
    /// `refund(Money::ZERO)` undoes a reservation completely.
    async fn refund(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        minimum_fee: Money,
    ) -> Result<Settlement, BudgetError> {
        self.settle(tenant_id, run_id, minimum_fee).await
    }

    /// Read the reservation for a run, if one is live.
    async fn get_reservation(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
    ) -> Result<Option<Reservation>, BudgetError>;

    /// Current tenant balance in micro-units.
    async fn balance(&self, tenant_id: TenantId) -> Result<Money, BudgetError>;

    /// Overwrite a tenant balance (admin / test seeding only).
    async fn set_balance(&self, tenant_id: TenantId, amount: Money) -> Result<(), BudgetError>;
}

#[async_trait]
impl<E> BudgetEngine for std::sync::Arc<E>
where
    E: BudgetEngine + ?Sized,
{
    async fn reserve(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        amount: Money,
        soft_limit: Money,
    ) -> Result<ReserveReceipt, BudgetError> {
        (**self).reserve(tenant_id, run_id, amount, soft_limit).await
    }

    async fn settle(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        actual: Money,
    ) -> Result<Settlement, BudgetError> {
        (**self).settle(tenant_id, run_id, actual).await
    }

    async fn refund(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        minimum_fee: Money,
    ) -> Result<Settlement, BudgetError> {
        (**self).refund(tenant_id, run_id, minimum_fee).await
    }

    async fn get_reservation(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
    ) -> Result<Option<Reservation>, BudgetError> {
        (**self).get_reservation(tenant_id, run_id).await
    }

    async fn balance(&self, tenant_id: TenantId) -> Result<Money, BudgetError> {
        (**self).balance(tenant_id).await
    }

    async fn set_balance(&self, tenant_id: TenantId, amount: Money) -> Result<(), BudgetError> {
        (**self).set_balance(tenant_id, amount).await
    }
}
