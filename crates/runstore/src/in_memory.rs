//! In-memory run store for tests/dev.
//!
//! A single `RwLock` over the run map gives each operation single-row
//! atomicity, which is all the CAS protocol needs.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use packflow_core::{FinalizeStage, Run, RunId, TenantId};

use crate::store::{CasConditions, CasOutcome, RunStore, RunStoreError, RunUpdate};

/// In-memory run store. Not intended for production use.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<RunId, Run>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(run: &mut Run, updates: RunUpdate, now: DateTime<Utc>) {
        if let Some(status) = updates.status {
            run.status = status;
        }
        if let Some(state) = updates.money_state {
            run.money_state = state;
        }
        if let Some(stage) = updates.finalize_stage {
            run.finalize_stage = stage;
        }
        if let Some(token) = updates.finalize_token {
            run.finalize_token = Some(token);
        }
        if let Some(at) = updates.finalize_claimed_at {
            run.finalize_claimed_at = Some(at);
        }
        if let Some(token) = updates.lease_token {
            run.lease_token = Some(token);
        }
        if let Some(at) = updates.lease_expires_at {
            run.lease_expires_at = Some(at);
        }
        if let Some(cost) = updates.actual_cost {
            run.actual_cost = Some(cost);
        }
        if let Some(key) = updates.result_key {
            run.result_key = Some(key);
        }
        if let Some(hash) = updates.result_hash {
            run.result_hash = Some(hash);
        }
        if let Some(code) = updates.last_error_reason_code {
            run.last_error_reason_code = Some(code);
        }
        if let Some(detail) = updates.last_error_detail {
            run.last_error_detail = Some(detail);
        }
        run.version += 1;
        run.updated_at = now;
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create(&self, run: &Run) -> Result<(), RunStoreError> {
        let mut runs = self
            .runs
            .write()
            .map_err(|_| RunStoreError::Storage("lock poisoned".to_string()))?;

        if runs.contains_key(&run.run_id) {
            return Err(RunStoreError::AlreadyExists(run.run_id));
        }
        if let Some(key) = &run.idempotency_key {
            let taken = runs
                .values()
                .any(|r| r.tenant_id == run.tenant_id && r.idempotency_key.as_deref() == Some(key));
            if taken {
                return Err(RunStoreError::DuplicateIdempotencyKey);
            }
        }

        runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn load(&self, run_id: RunId) -> Result<Option<Run>, RunStoreError> {
        let runs = self
            .runs
            .read()
            .map_err(|_| RunStoreError::Storage("lock poisoned".to_string()))?;
        Ok(runs.get(&run_id).cloned())
    }

    async fn load_for_tenant(
        &self,
        run_id: RunId,
        tenant_id: TenantId,
    ) -> Result<Option<Run>, RunStoreError> {
        let runs = self
            .runs
            .read()
            .map_err(|_| RunStoreError::Storage("lock poisoned".to_string()))?;
        Ok(runs
            .get(&run_id)
            .filter(|r| r.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        tenant_id: TenantId,
        idempotency_key: &str,
    ) -> Result<Option<Run>, RunStoreError> {
        let runs = self
            .runs
            .read()
            .map_err(|_| RunStoreError::Storage("lock poisoned".to_string()))?;
        Ok(runs
            .values()
            .find(|r| {
                r.tenant_id == tenant_id && r.idempotency_key.as_deref() == Some(idempotency_key)
            })
            .cloned())
    }

    async fn cas_update(
        &self,
        run_id: RunId,
        expected_version: u64,
        updates: RunUpdate,
        conditions: CasConditions,
    ) -> Result<CasOutcome, RunStoreError> {
        let mut runs = self
            .runs
            .write()
            .map_err(|_| RunStoreError::Storage("lock poisoned".to_string()))?;

        let Some(run) = runs.get_mut(&run_id) else {
            return Ok(CasOutcome::Stale);
        };

        if run.version != expected_version || !conditions.matches(run) {
            return Ok(CasOutcome::Stale);
        }

        Self::apply(run, updates, Utc::now());
        Ok(CasOutcome::Applied(run.clone()))
    }

    async fn scan_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Run>, RunStoreError> {
        let runs = self
            .runs
            .read()
            .map_err(|_| RunStoreError::Storage("lock poisoned".to_string()))?;

        let mut expired: Vec<Run> = runs
            .values()
            .filter(|r| r.lease_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.lease_expires_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn scan_stuck_claimed(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Run>, RunStoreError> {
        let runs = self
            .runs
            .read()
            .map_err(|_| RunStoreError::Storage("lock poisoned".to_string()))?;

        let mut stuck: Vec<Run> = runs
            .values()
            .filter(|r| {
                r.finalize_stage == FinalizeStage::Claimed
                    && r.finalize_claimed_at.is_some_and(|at| at < cutoff)
            })
            .cloned()
            .collect();
        stuck.sort_by_key(|r| r.finalize_claimed_at);
        stuck.truncate(limit);
        Ok(stuck)
    }
}
