//! Two-phase finalize: exactly-once terminal transition for a run.
//!
//! Every finalize attempt runs the same sequence:
//!
//! 1. **Claim** - CAS `finalize_stage UNCLAIMED -> CLAIMED` with a fresh
//!    token. Losing the CAS means another actor owns the terminal
//!    transition; the loser stops with no side effects.
//! 2. **Side effects** - settle (success) or refund (failure/expiry) on the
//!    budget engine. A missing reservation here means another actor already
//!    settled; the claim holder aborts WITHOUT writing a terminal status -
//!    the reconciler will advance the log if the winner died first.
//! 3. **Commit** - CAS the terminal status/money state, conditioned on
//!    still holding the claim token.
//!
//! `CLAIMED` never transitions back to `UNCLAIMED`; recovery always forces
//! forward (see the reconciler).

use chrono::Utc;
use thiserror::Error;
use tracing::{error, warn};

use packflow_budget::{BudgetEngine, BudgetError};
use packflow_core::{
    FinalizeStage, FinalizeToken, LeaseToken, Money, MoneyState, Run, RunStatus,
};
use packflow_runstore::{CasConditions, CasOutcome, RunStore, RunStoreError, RunUpdate};

/// Reason code written by the reaper's expired-lease path.
pub const REASON_WORKER_TIMEOUT: &str = "WORKER_TIMEOUT";

/// Finalize failure (real failures only; lost races are [`FinalizeOutcome::LostRace`]).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FinalizeError {
    /// The run's money state is not `RESERVED`; settling would be unsound.
    #[error("money state is {0}, expected RESERVED")]
    NotReserved(MoneyState),

    /// The requested charge exceeds what was reserved. The budget engine
    /// would clamp it, but an executor reporting such a cost is a bug worth
    /// failing loudly on.
    #[error("charge {charge} exceeds reservation {reserved}")]
    ChargeExceedsReservation { charge: Money, reserved: Money },

    /// The commit CAS failed even though this actor held the claim. Should
    /// not happen; logged and surfaced, never retried.
    #[error("terminal commit lost despite held claim")]
    CommitLost,

    #[error("budget engine error: {0}")]
    Budget(BudgetError),

    #[error("run store error: {0}")]
    Store(#[from] RunStoreError),
}

/// Outcome of a finalize attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    /// This actor won the race and wrote the terminal record.
    Winner(Run),
    /// Another actor owns (or already finished) the terminal transition.
    /// Expected under concurrency; callers absorb it silently.
    LostRace,
}

impl FinalizeOutcome {
    pub fn is_winner(&self) -> bool {
        matches!(self, FinalizeOutcome::Winner(_))
    }
}

/// Result artifact details carried into a success-path commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuccessResult {
    pub result_key: String,
    pub result_hash: String,
    pub actual_cost: Money,
}

/// Drives runs from `PROCESSING` to a terminal status exactly once.
#[derive(Debug, Clone)]
pub struct Finalizer<S, B> {
    run_store: S,
    budget: B,
}

impl<S, B> Finalizer<S, B>
where
    S: RunStore,
    B: BudgetEngine,
{
    pub fn new(run_store: S, budget: B) -> Self {
        Self { run_store, budget }
    }

    /// Worker success path: charge the actual cost, record the artifact,
    /// terminal `COMPLETED / SETTLED`.
    pub async fn finalize_success(
        &self,
        run: &Run,
        lease_token: LeaseToken,
        result: SuccessResult,
    ) -> Result<FinalizeOutcome, FinalizeError> {
        self.two_phase(
            run,
            CasConditions::new().lease_token(lease_token),
            result.actual_cost,
            RunStatus::Completed,
            MoneyState::Settled,
            RunUpdate::new().result(result.result_key, result.result_hash),
        )
        .await
    }

    /// Worker failure path: charge only the minimum fee, terminal
    /// `FAILED / REFUNDED`.
    pub async fn finalize_failure(
        &self,
        run: &Run,
        lease_token: LeaseToken,
        reason_code: &str,
        detail: &str,
    ) -> Result<FinalizeOutcome, FinalizeError> {
        self.two_phase(
            run,
            CasConditions::new().lease_token(lease_token),
            run.minimum_fee,
            RunStatus::Failed,
            MoneyState::Refunded,
            RunUpdate::new().error(reason_code, detail),
        )
        .await
    }

    /// Reaper path for an expired lease: no lease-token condition (the
    /// worker is presumed dead; `finalize_stage = UNCLAIMED` is the race
    /// protection), terminal `EXPIRED / REFUNDED`.
    pub async fn finalize_expired(&self, run: &Run) -> Result<FinalizeOutcome, FinalizeError> {
        self.two_phase(
            run,
            CasConditions::new(),
            run.minimum_fee,
            RunStatus::Expired,
            MoneyState::Refunded,
            RunUpdate::new().error(
                REASON_WORKER_TIMEOUT,
                "worker lease expired; run terminated by reaper",
            ),
        )
        .await
    }

    async fn two_phase(
        &self,
        run: &Run,
        extra_claim: CasConditions,
        charge: Money,
        terminal: RunStatus,
        terminal_money: MoneyState,
        extra_commit: RunUpdate,
    ) -> Result<FinalizeOutcome, FinalizeError> {
        // Fast path: someone else already finalized (or is mid-claim).
        if run.status != RunStatus::Processing || run.finalize_stage != FinalizeStage::Unclaimed {
            return Ok(FinalizeOutcome::LostRace);
        }
        if run.money_state != MoneyState::Reserved {
            return Err(FinalizeError::NotReserved(run.money_state));
        }
        if charge > run.reservation_max_cost {
            return Err(FinalizeError::ChargeExceedsReservation {
                charge,
                reserved: run.reservation_max_cost,
            });
        }

        // Phase 1: claim.
        let token = FinalizeToken::mint();
        let claim = self
            .run_store
            .cas_update(
                run.run_id,
                run.version,
                RunUpdate::new()
                    .finalize_stage(FinalizeStage::Claimed)
                    .finalize_token(token)
                    .finalize_claimed_at(Utc::now()),
                extra_claim
                    .status(RunStatus::Processing)
                    .finalize_stage(FinalizeStage::Unclaimed),
            )
            .await?;

        let claimed = match claim {
            CasOutcome::Applied(run) => run,
            CasOutcome::Stale => return Ok(FinalizeOutcome::LostRace),
        };

        // Phase 2a: settle the money. The non-idempotent settle is the race
        // detector: a missing reservation means another actor got here
        // first, and this actor must not write the terminal status.
        let settlement = match self.budget.settle(run.tenant_id, run.run_id, charge).await {
            Ok(s) => s,
            Err(BudgetError::NoReservation) => {
                warn!(
                    run_id = %run.run_id,
                    "reservation already settled by another actor; aborting finalize"
                );
                return Ok(FinalizeOutcome::LostRace);
            }
            Err(e) => return Err(FinalizeError::Budget(e)),
        };

        // Phase 2b: commit the terminal record.
        let commit = self
            .run_store
            .cas_update(
                claimed.run_id,
                claimed.version,
                {
                    let mut updates = extra_commit;
                    updates.status = Some(terminal);
                    updates.money_state = Some(terminal_money);
                    updates.finalize_stage = Some(FinalizeStage::Committed);
                    updates.actual_cost = Some(settlement.charge);
                    updates
                },
                CasConditions::new()
                    .finalize_stage(FinalizeStage::Claimed)
                    .finalize_token(token),
            )
            .await?;

        match commit {
            CasOutcome::Applied(run) => Ok(FinalizeOutcome::Winner(run)),
            CasOutcome::Stale => {
                error!(
                    run_id = %run.run_id,
                    "terminal commit lost despite held claim; leaving for reconciler"
                );
                Err(FinalizeError::CommitLost)
            }
        }
    }
}
