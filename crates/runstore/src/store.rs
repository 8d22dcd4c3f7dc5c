//! Run store trait, CAS update/condition types, errors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use packflow_core::{
    FinalizeStage, FinalizeToken, LeaseToken, Money, MoneyState, Run, RunId, RunStatus, TenantId,
};

/// Run store error.
///
/// Lost CAS races are NOT errors (see [`CasOutcome::Stale`]); this enum
/// covers genuine storage failures and constraint violations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RunStoreError {
    #[error("run already exists: {0}")]
    AlreadyExists(RunId),

    /// Another run already holds this `(tenant, idempotency_key)` pair.
    /// The submission path resolves this by re-reading the existing run.
    #[error("idempotency key already in use for tenant")]
    DuplicateIdempotencyKey,

    #[error("storage error: {0}")]
    Storage(String),
}

/// Field updates applied by a CAS. `None` leaves the field untouched.
///
/// Only fields that some lifecycle transition actually writes are present;
/// fields are set-only (nothing in the protocol ever nulls a field out).
/// The store bumps `version` and `updated_at` on every applied update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub money_state: Option<MoneyState>,
    pub finalize_stage: Option<FinalizeStage>,
    pub finalize_token: Option<FinalizeToken>,
    pub finalize_claimed_at: Option<DateTime<Utc>>,
    pub lease_token: Option<LeaseToken>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub actual_cost: Option<Money>,
    pub result_key: Option<String>,
    pub result_hash: Option<String>,
    pub last_error_reason_code: Option<String>,
    pub last_error_detail: Option<String>,
}

impl RunUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn money_state(mut self, state: MoneyState) -> Self {
        self.money_state = Some(state);
        self
    }

    pub fn finalize_stage(mut self, stage: FinalizeStage) -> Self {
        self.finalize_stage = Some(stage);
        self
    }

    pub fn finalize_token(mut self, token: FinalizeToken) -> Self {
        self.finalize_token = Some(token);
        self
    }

    pub fn finalize_claimed_at(mut self, at: DateTime<Utc>) -> Self {
        self.finalize_claimed_at = Some(at);
        self
    }

    pub fn lease(mut self, token: LeaseToken, expires_at: DateTime<Utc>) -> Self {
        self.lease_token = Some(token);
        self.lease_expires_at = Some(expires_at);
        self
    }

    pub fn actual_cost(mut self, cost: Money) -> Self {
        self.actual_cost = Some(cost);
        self
    }

    pub fn result(mut self, key: impl Into<String>, hash: impl Into<String>) -> Self {
        self.result_key = Some(key.into());
        self.result_hash = Some(hash.into());
        self
    }

    pub fn error(mut self, reason_code: impl Into<String>, detail: impl Into<String>) -> Self {
        self.last_error_reason_code = Some(reason_code.into());
        self.last_error_detail = Some(detail.into());
        self
    }
}

/// Extra predicates a CAS must satisfy beyond the version check.
///
/// All present fields must match by equality, except
/// `finalize_claimed_before` which matches when the stored
/// `finalize_claimed_at` is strictly older than the given instant (used by
/// the reconciler to adopt stale claims).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CasConditions {
    pub status: Option<RunStatus>,
    pub money_state: Option<MoneyState>,
    pub finalize_stage: Option<FinalizeStage>,
    pub finalize_token: Option<FinalizeToken>,
    pub lease_token: Option<LeaseToken>,
    pub finalize_claimed_before: Option<DateTime<Utc>>,
}

impl CasConditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn money_state(mut self, state: MoneyState) -> Self {
        self.money_state = Some(state);
        self
    }

    pub fn finalize_stage(mut self, stage: FinalizeStage) -> Self {
        self.finalize_stage = Some(stage);
        self
    }

    pub fn finalize_token(mut self, token: FinalizeToken) -> Self {
        self.finalize_token = Some(token);
        self
    }

    pub fn lease_token(mut self, token: LeaseToken) -> Self {
        self.lease_token = Some(token);
        self
    }

    pub fn finalize_claimed_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.finalize_claimed_before = Some(cutoff);
        self
    }

    /// Evaluate the predicates against a run (shared by the in-memory
    /// backend and tests; the Postgres backend compiles them into WHERE).
    pub fn matches(&self, run: &Run) -> bool {
        if let Some(status) = self.status {
            if run.status != status {
                return false;
            }
        }
        if let Some(state) = self.money_state {
            if run.money_state != state {
                return false;
            }
        }
        if let Some(stage) = self.finalize_stage {
            if run.finalize_stage != stage {
                return false;
            }
        }
        if let Some(token) = self.finalize_token {
            if run.finalize_token != Some(token) {
                return false;
            }
        }
        if let Some(token) = self.lease_token {
            if run.lease_token != Some(token) {
                return false;
            }
        }
        if let Some(cutoff) = self.finalize_claimed_before {
            match run.finalize_claimed_at {
                Some(at) if at < cutoff => {}
                _ => return false,
            }
        }
        true
    }
}

/// Result of a CAS attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The update applied; carries the post-update record (version bumped).
    Applied(Run),
    /// Version mismatch or a failed condition. The caller lost the race and
    /// must abort silently - this is an expected outcome, not an error.
    Stale,
}

impl CasOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, CasOutcome::Applied(_))
    }

    pub fn into_applied(self) -> Option<Run> {
        match self {
            CasOutcome::Applied(run) => Some(run),
            CasOutcome::Stale => None,
        }
    }
}

/// Durable, linearizable storage of run records with CAS updates.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a new run (`version` must be 1). Fails if the run id exists
    /// or the `(tenant, idempotency_key)` pair is already taken.
    async fn create(&self, run: &Run) -> Result<(), RunStoreError>;

    /// Load the current record.
    async fn load(&self, run_id: RunId) -> Result<Option<Run>, RunStoreError>;

    /// Load with tenant ownership enforced: a run owned by a different
    /// tenant is indistinguishable from a missing one.
    async fn load_for_tenant(
        &self,
        run_id: RunId,
        tenant_id: TenantId,
    ) -> Result<Option<Run>, RunStoreError>;

    /// Look up a run by its idempotent-submit key.
    async fn find_by_idempotency_key(
        &self,
        tenant_id: TenantId,
        idempotency_key: &str,
    ) -> Result<Option<Run>, RunStoreError>;

    /// Atomically: if `version == expected_version` and all `conditions`
    /// hold, apply `updates` and increment the version.
    async fn cas_update(
        &self,
        run_id: RunId,
        expected_version: u64,
        updates: RunUpdate,
        conditions: CasConditions,
    ) -> Result<CasOutcome, RunStoreError>;

    /// Runs in `PROCESSING` whose lease expired before `now`.
    async fn scan_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Run>, RunStoreError>;

    /// Runs stuck in `CLAIMED` since before `cutoff`.
    async fn scan_stuck_claimed(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Run>, RunStoreError>;
}

#[async_trait]
impl<S> RunStore for std::sync::Arc<S>
where
    S: RunStore + ?Sized,
{
    async fn create(&self, run: &Run) -> Result<(), RunStoreError> {
        (**self).create(run).await
    }

    async fn load(&self, run_id: RunId) -> Result<Option<Run>, RunStoreError> {
        (**self).load(run_id).await
    }

    async fn load_for_tenant(
        &self,
        run_id: RunId,
        tenant_id: TenantId,
    ) -> Result<Option<Run>, RunStoreError> {
        (**self).load_for_tenant(run_id, tenant_id).await
    }

    async fn find_by_idempotency_key(
        &self,
        tenant_id: TenantId,
        idempotency_key: &str,
    ) -> Result<Option<Run>, RunStoreError> {
        (**self)
            .find_by_idempotency_key(tenant_id, idempotency_key)
            .await
    }

    async fn cas_update(
        &self,
        run_id: RunId,
        expected_version: u64,
        updates: RunUpdate,
        conditions: CasConditions,
    ) -> Result<CasOutcome, RunStoreError> {
        (**self)
            .cas_update(run_id, expected_version, updates, conditions)
            .await
    }

    async fn scan_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Run>, RunStoreError> {
        (**self).scan_expired_leases(now, limit).await
    }

    async fn scan_stuck_claimed(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Run>, RunStoreError> {
        (**self).scan_stuck_claimed(cutoff, limit).await
    }
}
