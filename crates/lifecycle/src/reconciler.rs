//! Reconciler: liveness for the finalize protocol.
//!
//! Two sweeps per cycle:
//!
//! 1. **Expired leases** - `PROCESSING` runs whose worker went quiet past
//!    its lease. Ordinary failure-path finalize, terminal `EXPIRED`.
//! 2. **Stuck claims** - runs parked in `CLAIMED` longer than `T_stuck`,
//!    meaning an actor claimed but died before commit. The budget engine
//!    disambiguates:
//!    - reservation still present: the crash happened before settle; adopt
//!      the claim and run the normal protocol from the settle onward;
//!    - reservation absent: settle already happened, only the log is
//!      behind; roll the record forward idempotently (force-settle),
//!      escalating to `AUDIT_REQUIRED` when the reservation TTL means the
//!      money trail can no longer be trusted.
//!
//! Every rescue path is CAS-guarded, so a worker waking up mid-rescue can
//! never double-commit and the ledger is never touched twice.

use chrono::Utc;
use tracing::{error, info, warn};

use packflow_budget::{BudgetEngine, BudgetError};
use packflow_core::{FinalizeStage, Money, MoneyState, Run, RunStatus, Timings};
use packflow_infra::{artifact_key, ArtifactMetadata, ObjectStore};
use packflow_runstore::{CasConditions, CasOutcome, RunStore, RunUpdate};

use crate::finalize::{FinalizeError, FinalizeOutcome, Finalizer};

/// Reason code for a claim abandoned before settle, rolled back by the
/// reconciler with no artifact present.
const REASON_FINALIZE_ABANDONED: &str = "FINALIZE_ABANDONED";
/// Reason code for a force-settled run with no artifact.
const REASON_RECONCILED_NO_RESULT: &str = "RECONCILED_NO_RESULT";

/// Counters for one reconciler cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Expired-lease runs driven to `EXPIRED`.
    pub expired_reaped: usize,
    /// Stuck claims completed via adopt-and-finish (case A).
    pub stuck_recovered: usize,
    /// Stuck claims rolled forward via force-settle (case B).
    pub stuck_rolled_forward: usize,
    /// Runs escalated to `AUDIT_REQUIRED`.
    pub audited: usize,
    /// Races lost to concurrently-finishing actors. Expected noise.
    pub lost_races: usize,
    /// Unexpected failures, left for the next sweep.
    pub failures: usize,
}

impl SweepStats {
    fn merge(self, other: SweepStats) -> SweepStats {
        SweepStats {
            expired_reaped: self.expired_reaped + other.expired_reaped,
            stuck_recovered: self.stuck_recovered + other.stuck_recovered,
            stuck_rolled_forward: self.stuck_rolled_forward + other.stuck_rolled_forward,
            audited: self.audited + other.audited,
            lost_races: self.lost_races + other.lost_races,
            failures: self.failures + other.failures,
        }
    }
}

/// Background sweeper guaranteeing every run reaches a terminal state.
#[derive(Debug, Clone)]
pub struct Reconciler<S, B, O> {
    run_store: S,
    budget: B,
    objects: O,
    finalizer: Finalizer<S, B>,
    timings: Timings,
    scan_limit: usize,
}

impl<S, B, O> Reconciler<S, B, O>
where
    S: RunStore + Clone,
    B: BudgetEngine + Clone,
    O: ObjectStore,
{
    pub fn new(run_store: S, budget: B, objects: O, timings: Timings) -> Self {
        let finalizer = Finalizer::new(run_store.clone(), budget.clone());
        Self {
            run_store,
            budget,
            objects,
            finalizer,
            timings,
            scan_limit: 100,
        }
    }

    pub fn with_scan_limit(mut self, limit: usize) -> Self {
        self.scan_limit = limit;
        self
    }

    /// Run both sweeps once and report what happened.
    pub async fn sweep_once(&self) -> SweepStats {
        let expired = self.sweep_expired_leases().await;
        let stuck = self.sweep_stuck_claims().await;
        let stats = expired.merge(stuck);
        if stats != SweepStats::default() {
            info!(
                expired_reaped = stats.expired_reaped,
                stuck_recovered = stats.stuck_recovered,
                stuck_rolled_forward = stats.stuck_rolled_forward,
                audited = stats.audited,
                lost_races = stats.lost_races,
                failures = stats.failures,
                "reconciler sweep finished"
            );
        }
        stats
    }

    /// Sweep forever on the configured period. Never returns.
    pub async fn run_forever(&self) {
        info!(period = ?self.timings.reconcile_period(), "reconciler started");
        loop {
            self.sweep_once().await;
            tokio::time::sleep(self.timings.reconcile_period()).await;
        }
    }

    async fn sweep_expired_leases(&self) -> SweepStats {
        let mut stats = SweepStats::default();

        let expired = match self
            .run_store
            .scan_expired_leases(Utc::now(), self.scan_limit)
            .await
        {
            Ok(runs) => runs,
            Err(e) => {
                error!(error = %e, "expired-lease scan failed");
                stats.failures += 1;
                return stats;
            }
        };

        for run in expired {
            match self.finalizer.finalize_expired(&run).await {
                Ok(FinalizeOutcome::Winner(run)) => {
                    info!(run_id = %run.run_id, charged = %run.minimum_fee, "reaped expired lease");
                    stats.expired_reaped += 1;
                }
                Ok(FinalizeOutcome::LostRace) => stats.lost_races += 1,
                Err(e) => {
                    error!(run_id = %run.run_id, error = %e, "expired-lease finalize failed");
                    stats.failures += 1;
                }
            }
        }
        stats
    }

    async fn sweep_stuck_claims(&self) -> SweepStats {
        let mut stats = SweepStats::default();
        let cutoff = Utc::now() - self.timings.t_stuck_chrono();

        let stuck = match self.run_store.scan_stuck_claimed(cutoff, self.scan_limit).await {
            Ok(runs) => runs,
            Err(e) => {
                error!(error = %e, "stuck-claim scan failed");
                stats.failures += 1;
                return stats;
            }
        };

        for run in stuck {
            match self.rescue_stuck(&run).await {
                Ok(outcome) => match outcome {
                    RescueOutcome::Recovered => stats.stuck_recovered += 1,
                    RescueOutcome::RolledForward => stats.stuck_rolled_forward += 1,
                    RescueOutcome::Audited => stats.audited += 1,
                    RescueOutcome::LostRace => stats.lost_races += 1,
                },
                Err(e) => {
                    error!(run_id = %run.run_id, error = %e, "stuck-claim rescue failed");
                    stats.failures += 1;
                }
            }
        }
        stats
    }

    async fn rescue_stuck(&self, run: &Run) -> Result<RescueOutcome, FinalizeError> {
        let reservation = self
            .budget
            .get_reservation(run.tenant_id, run.run_id)
            .await
            .map_err(FinalizeError::Budget)?;

        match reservation {
            Some(_) => self.adopt_and_finish(run).await,
            None => self.force_settle(run).await,
        }
    }

    /// Case A: the claimed actor died before (or during) settle. Adopt the
    /// stored claim, then run the normal protocol from phase 2a onward.
    async fn adopt_and_finish(&self, run: &Run) -> Result<RescueOutcome, FinalizeError> {
        let Some(token) = run.finalize_token else {
            // A CLAIMED run without a token should not exist.
            warn!(run_id = %run.run_id, "claimed run has no finalize token; auditing");
            let artifact = self
                .objects
                .head(&artifact_key(run.run_id))
                .await
                .map_err(|e| FinalizeError::Budget(BudgetError::Storage(e.to_string())))?;
            return self.mark_audit_required(run, artifact.as_ref()).await;
        };

        let cutoff = Utc::now() - self.timings.t_stuck_chrono();
        let adopted = self
            .run_store
            .cas_update(
                run.run_id,
                run.version,
                RunUpdate::new().finalize_claimed_at(Utc::now()),
                CasConditions::new()
                    .finalize_stage(FinalizeStage::Claimed)
                    .finalize_claimed_before(cutoff),
            )
            .await?;

        let adopted = match adopted {
            CasOutcome::Applied(run) => run,
            CasOutcome::Stale => return Ok(RescueOutcome::LostRace),
        };

        // Infer the abandoned actor's intent from the artifact: an uploaded
        // result means the execution finished, so settle for its cost;
        // otherwise refund down to the minimum fee.
        let artifact = self
            .objects
            .head(&artifact_key(run.run_id))
            .await
            .map_err(|e| FinalizeError::Budget(BudgetError::Storage(e.to_string())))?;

        let (charge, terminal, terminal_money, extra) = match &artifact {
            Some(meta) => (
                meta.actual_cost.min(run.reservation_max_cost),
                RunStatus::Completed,
                MoneyState::Settled,
                RunUpdate::new().result(artifact_key(run.run_id), meta.sha256.clone()),
            ),
            None => (
                run.minimum_fee,
                RunStatus::Failed,
                MoneyState::Refunded,
                RunUpdate::new().error(
                    REASON_FINALIZE_ABANDONED,
                    "finalize claim abandoned before settle; refunded by reconciler",
                ),
            ),
        };

        let settlement = match self.budget.settle(run.tenant_id, run.run_id, charge).await {
            Ok(s) => s,
            Err(BudgetError::NoReservation) => {
                // Raced with a recovering actor; it owns the commit now.
                return Ok(RescueOutcome::LostRace);
            }
            Err(e) => return Err(FinalizeError::Budget(e)),
        };

        let commit = self
            .run_store
            .cas_update(
                adopted.run_id,
                adopted.version,
                {
                    let mut updates = extra;
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
            CasOutcome::Applied(run) => {
                info!(run_id = %run.run_id, status = %run.status, "recovered stuck claim");
                Ok(RescueOutcome::Recovered)
            }
            CasOutcome::Stale => {
                error!(run_id = %run.run_id, "adopted-claim commit lost");
                Err(FinalizeError::CommitLost)
            }
        }
    }

    /// Case B: the settle already happened; only the run log is behind.
    /// Advance it with one scoped CAS. The `CLAIMED + RESERVED` condition
    /// pair guarantees an already-committed or already-refunded run is
    /// never rewritten, which is what makes this path idempotent.
    async fn force_settle(&self, run: &Run) -> Result<RescueOutcome, FinalizeError> {
        let claim_age = run
            .finalize_claimed_at
            .map(|at| Utc::now() - at)
            .unwrap_or(chrono::Duration::MAX);

        let artifact = self
            .objects
            .head(&artifact_key(run.run_id))
            .await
            .map_err(|e| FinalizeError::Budget(BudgetError::Storage(e.to_string())))?;

        // TTL safety check: past the reservation TTL we cannot distinguish
        // "settled" from "expired on its own", so the amount cannot be
        // trusted and a human has to look.
        if claim_age >= self.timings.t_res_chrono() {
            warn!(
                run_id = %run.run_id,
                claim_age_secs = claim_age.num_seconds(),
                "claim older than reservation TTL; escalating to audit"
            );
            return self.mark_audit_required(run, artifact.as_ref()).await;
        }

        // Cost recovery: the artifact metadata has the true charge; without
        // it, the reservation maximum is a conservative upper bound (the
        // settled charge cannot have exceeded it). The balance is already
        // correct either way - only the log's actual_cost is approximate.
        let (recovered_cost, terminal, extra) = match &artifact {
            Some(meta) => (
                meta.actual_cost.min(run.reservation_max_cost),
                RunStatus::Completed,
                RunUpdate::new().result(artifact_key(run.run_id), meta.sha256.clone()),
            ),
            None => (
                run.reservation_max_cost,
                RunStatus::Failed,
                RunUpdate::new().error(
                    REASON_RECONCILED_NO_RESULT,
                    "settled without a committed result; rolled forward by reconciler",
                ),
            ),
        };

        let commit = self
            .run_store
            .cas_update(
                run.run_id,
                run.version,
                {
                    let mut updates = extra;
                    updates.status = Some(terminal);
                    updates.money_state = Some(MoneyState::Settled);
                    updates.finalize_stage = Some(FinalizeStage::Committed);
                    updates.actual_cost = Some(recovered_cost);
                    updates
                },
                CasConditions::new()
                    .finalize_stage(FinalizeStage::Claimed)
                    .money_state(MoneyState::Reserved),
            )
            .await?;

        match commit {
            CasOutcome::Applied(run) => {
                info!(
                    run_id = %run.run_id,
                    status = %run.status,
                    actual_cost = %recovered_cost,
                    "force-settled stuck claim"
                );
                Ok(RescueOutcome::RolledForward)
            }
            CasOutcome::Stale => Ok(RescueOutcome::LostRace),
        }
    }

    /// Terminal escape hatch: money moved but the exact amount cannot be
    /// verified. The run is marked for human review without blocking
    /// progress, and the best available figure (artifact-reported cost
    /// capped at the reservation, or the reservation ceiling itself) is
    /// still recorded as `actual_cost` so auditors have a starting point.
    async fn mark_audit_required(
        &self,
        run: &Run,
        artifact: Option<&ArtifactMetadata>,
    ) -> Result<RescueOutcome, FinalizeError> {
        let recovered_cost = artifact
            .map(|meta| meta.actual_cost.min(run.reservation_max_cost))
            .unwrap_or(run.reservation_max_cost);

        let (terminal, extra) = match artifact {
            Some(meta) => (
                RunStatus::Completed,
                RunUpdate::new().result(artifact_key(run.run_id), meta.sha256.clone()),
            ),
            None => (
                RunStatus::Failed,
                RunUpdate::new().error(
                    REASON_RECONCILED_NO_RESULT,
                    "settled amount unverifiable; reservation ceiling recorded",
                ),
            ),
        };

        let commit = self
            .run_store
            .cas_update(
                run.run_id,
                run.version,
                {
                    let mut updates = extra;
                    updates.status = Some(terminal);
                    updates.money_state = Some(MoneyState::AuditRequired);
                    updates.finalize_stage = Some(FinalizeStage::Committed);
                    updates.actual_cost = Some(recovered_cost);
                    updates
                },
                CasConditions::new()
                    .finalize_stage(FinalizeStage::Claimed)
                    .money_state(MoneyState::Reserved),
            )
            .await?;

        match commit {
            CasOutcome::Applied(run) => {
                warn!(run_id = %run.run_id, "run marked AUDIT_REQUIRED");
                Ok(RescueOutcome::Audited)
            }
            CasOutcome::Stale => Ok(RescueOutcome::LostRace),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RescueOutcome {
    Recovered,
    RolledForward,
    Audited,
    LostRace,
}

/// Audit tooling: resolve an `AUDIT_REQUIRED` run to `SETTLED` once a human
/// confirmed the charged amount. The only permitted mutation of a terminal
/// run.
pub async fn resolve_audit<S: RunStore>(
    run_store: &S,
    run: &Run,
    confirmed_cost: Money,
) -> Result<bool, packflow_runstore::RunStoreError> {
    let outcome = run_store
        .cas_update(
            run.run_id,
            run.version,
            RunUpdate::new()
                .money_state(MoneyState::Settled)
                .actual_cost(confirmed_cost),
            CasConditions::new()
                .finalize_stage(FinalizeStage::Committed)
                .money_state(MoneyState::AuditRequired),
        )
        .await?;
    Ok(outcome.applied())
}
