//! Submission path: reserve budget, create the run, enqueue dispatch.
//!
//! Order matters: the reservation is taken first, so a run record never
//! exists without money backing it. A failure after the reservation is
//! compensated with a full refund before the error propagates; a failure
//! after the run became visible additionally drives the record to
//! `FAILED / REFUNDED` so pollers are not left staring at a zombie.

use chrono::Utc;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{error, info, instrument};

use packflow_budget::{BudgetEngine, BudgetError};
use packflow_core::{
    DomainError, Money, MoneyState, PackSpec, Run, RunId, RunStatus, TenantId, Timings,
};
use packflow_infra::{DispatchMessage, DispatchQueue, QueueError};
use packflow_runstore::{CasConditions, RunStore, RunStoreError, RunUpdate};

/// Minimum-fee floor (0.0050 display units).
const MINIMUM_FEE_FLOOR: Money = Money::from_micros(5_000);
/// Minimum-fee cap (0.1000 display units).
const MINIMUM_FEE_CAP: Money = Money::from_micros(100_000);

#[derive(Debug, Error)]
pub enum SubmitError {
    /// The tenant balance cannot cover the reservation. Nothing was mutated.
    #[error("budget exceeded: requested {requested}, available {available}")]
    BudgetExceeded { requested: Money, available: Money },

    /// The idempotency key is already bound to a different payload.
    #[error("idempotency key reused with a different payload")]
    IdempotencyConflict,

    #[error(transparent)]
    Validation(#[from] DomainError),

    #[error("run store error: {0}")]
    Store(#[from] RunStoreError),

    #[error("budget engine error: {0}")]
    Budget(BudgetError),

    #[error("dispatch enqueue failed: {0}")]
    Queue(QueueError),
}

/// A typed submit command, as handed over by the HTTP frontend.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub tenant_id: TenantId,
    pub pack: PackSpec,
    pub max_cost: Money,
    pub idempotency_key: Option<String>,
}

/// Submission policy knobs.
#[derive(Debug, Clone, Copy)]
pub struct SubmitterConfig {
    /// Lowest balance a reservation may leave behind (zero or negative).
    pub soft_limit: Money,
    /// How long run records stay pollable.
    pub retention: chrono::Duration,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            soft_limit: Money::ZERO,
            retention: chrono::Duration::days(30),
        }
    }
}

/// The submission path.
#[derive(Debug, Clone)]
pub struct Submitter<S, B, Q> {
    run_store: S,
    budget: B,
    queue: Q,
    timings: Timings,
    config: SubmitterConfig,
}

impl<S, B, Q> Submitter<S, B, Q>
where
    S: RunStore,
    B: BudgetEngine,
    Q: DispatchQueue,
{
    pub fn new(run_store: S, budget: B, queue: Q, timings: Timings, config: SubmitterConfig) -> Self {
        Self {
            run_store,
            budget,
            queue,
            timings,
            config,
        }
    }

    /// Submit a run. Replays of the same `(tenant, idempotency_key, payload)`
    /// return the original run; a reused key with a different payload is a
    /// conflict.
    #[instrument(skip(self, request), fields(tenant_id = %request.tenant_id), err)]
    pub async fn submit(&self, request: SubmitRequest) -> Result<Run, SubmitError> {
        let max_cost = request
            .max_cost
            .validate_boundary()
            .map_err(|e| DomainError::validation(e.to_string()))?;
        if let Some(key) = &request.idempotency_key {
            if key.len() < 8 || key.len() > 64 {
                return Err(DomainError::validation(
                    "idempotency key must be 8-64 characters",
                )
                .into());
            }
        }

        let payload_hash = payload_hash(&request.pack, max_cost);

        // Replay check before any mutation.
        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = self
                .run_store
                .find_by_idempotency_key(request.tenant_id, key)
                .await?
            {
                return self.resolve_replay(existing, &payload_hash);
            }
        }

        // 2% of the reservation, clamped to [floor, cap] and never above
        // the reservation itself.
        let minimum_fee = max_cost
            .percent(2)
            .clamp(MINIMUM_FEE_FLOOR, MINIMUM_FEE_CAP)
            .min(max_cost);

        let run_id = RunId::new();

        // Reserve first: no run record ever exists without backing money.
        match self
            .budget
            .reserve(request.tenant_id, run_id, max_cost, self.config.soft_limit)
            .await
        {
            Ok(_) => {}
            Err(BudgetError::Insufficient {
                requested,
                available,
            }) => {
                return Err(SubmitError::BudgetExceeded {
                    requested,
                    available,
                })
            }
            Err(e) => return Err(SubmitError::Budget(e)),
        }

        let now = Utc::now();
        let run = Run::new_reserved(
            run_id,
            request.tenant_id,
            request.pack.clone(),
            max_cost,
            minimum_fee,
            request.idempotency_key.clone(),
            payload_hash.clone(),
            now + self.config.retention,
            now,
        );

        match self.run_store.create(&run).await {
            Ok(()) => {}
            Err(RunStoreError::DuplicateIdempotencyKey) => {
                // Two submits raced on the same key; the other one won the
                // insert. Undo our reservation and replay theirs.
                self.compensate_reservation(request.tenant_id, run_id).await;
                let key = request.idempotency_key.as_deref().unwrap_or_default();
                let existing = self
                    .run_store
                    .find_by_idempotency_key(request.tenant_id, key)
                    .await?
                    .ok_or(SubmitError::IdempotencyConflict)?;
                return self.resolve_replay(existing, &payload_hash);
            }
            Err(e) => {
                self.compensate_reservation(request.tenant_id, run_id).await;
                return Err(e.into());
            }
        }

        if let Err(e) = self
            .queue
            .enqueue(DispatchMessage {
                run_id,
                tenant_id: request.tenant_id,
                pack_kind: request.pack.kind.clone(),
                lease_ttl_seconds: self.timings.lease_ttl().as_secs(),
            })
            .await
        {
            error!(run_id = %run_id, error = %e, "dispatch enqueue failed; refunding");
            self.compensate_reservation(request.tenant_id, run_id).await;
            // The run is already visible; park it in a terminal state so
            // pollers see the failure instead of an eternal QUEUED.
            let _ = self
                .run_store
                .cas_update(
                    run_id,
                    run.version,
                    RunUpdate::new()
                        .status(RunStatus::Failed)
                        .money_state(MoneyState::Refunded)
                        .error("QUEUE_ENQUEUE_FAILED", e.to_string()),
                    CasConditions::new().status(RunStatus::Queued),
                )
                .await;
            return Err(SubmitError::Queue(e));
        }

        info!(run_id = %run_id, max_cost = %max_cost, "run submitted");
        Ok(run)
    }

    fn resolve_replay(&self, existing: Run, payload_hash: &str) -> Result<Run, SubmitError> {
        if existing.payload_hash == payload_hash {
            info!(run_id = %existing.run_id, "idempotent replay");
            Ok(existing)
        } else {
            Err(SubmitError::IdempotencyConflict)
        }
    }

    /// Undo a reservation for a run that never became (or never stays)
    /// dispatchable. Refund failures are logged, not propagated: the
    /// reservation TTL bounds the damage.
    async fn compensate_reservation(&self, tenant_id: TenantId, run_id: RunId) {
        match self.budget.refund(tenant_id, run_id, Money::ZERO).await {
            Ok(_) | Err(BudgetError::NoReservation) => {}
            Err(e) => {
                error!(
                    run_id = %run_id,
                    error = %e,
                    "compensating refund failed; reservation will expire on its own"
                );
            }
        }
    }
}

/// Canonical hash binding an idempotency key to its payload.
pub fn payload_hash(pack: &PackSpec, max_cost: Money) -> String {
    let canonical = serde_json::json!({
        "kind": pack.kind.as_str(),
        "input": pack.input,
        "timebox_secs": pack.timebox_secs,
        "max_cost_micros": max_cost.as_micros(),
    });
    let digest = Sha256::digest(canonical.to_string().as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
