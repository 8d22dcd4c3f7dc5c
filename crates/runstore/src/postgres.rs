//! Postgres-backed run store.
//!
//! The run row is the authoritative record; every mutation after insert is a
//! single `UPDATE ... WHERE run_id = $1 AND version = $2 AND <conditions>`
//! statement, so the optimistic-lock check and the write are one atomic
//! step. Rowcount 0 means the caller lost the race ([`CasOutcome::Stale`]),
//! never an error.
//!
//! ## Expected schema
//!
//! ```sql
//! CREATE TABLE runs (
//!     run_id                      UUID PRIMARY KEY,
//!     tenant_id                   UUID NOT NULL,
//!     pack_kind                   TEXT NOT NULL,
//!     pack_input                  JSONB NOT NULL,
//!     timebox_secs                INT NOT NULL,
//!     version                     BIGINT NOT NULL,
//!     status                      TEXT NOT NULL,
//!     money_state                 TEXT NOT NULL,
//!     finalize_stage              TEXT NOT NULL,
//!     finalize_token              UUID,
//!     finalize_claimed_at         TIMESTAMPTZ,
//!     lease_token                 UUID,
//!     lease_expires_at            TIMESTAMPTZ,
//!     reservation_max_cost_micros BIGINT NOT NULL,
//!     actual_cost_micros          BIGINT,
//!     minimum_fee_micros          BIGINT NOT NULL,
//!     idempotency_key             TEXT,
//!     payload_hash                TEXT NOT NULL,
//!     result_key                  TEXT,
//!     result_hash                 TEXT,
//!     last_error_reason_code      TEXT,
//!     last_error_detail           TEXT,
//!     retention_until             TIMESTAMPTZ NOT NULL,
//!     created_at                  TIMESTAMPTZ NOT NULL,
//!     updated_at                  TIMESTAMPTZ NOT NULL
//! );
//!
//! CREATE UNIQUE INDEX uq_runs_tenant_idempotency
//!     ON runs (tenant_id, idempotency_key)
//!     WHERE idempotency_key IS NOT NULL;
//! CREATE INDEX idx_runs_status_lease ON runs (status, lease_expires_at);
//! CREATE INDEX idx_runs_stage_claimed ON runs (finalize_stage, finalize_claimed_at);
//! ```
//!
//! ## Error mapping
//!
//! | Postgres error | `RunStoreError` | Scenario |
//! |----------------|-----------------|----------|
//! | `23505` on primary key | `AlreadyExists` | Duplicate `run_id` insert |
//! | `23505` on idempotency index | `DuplicateIdempotencyKey` | Submit race on the same key |
//! | anything else | `Storage` | Connection/statement failures |

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::instrument;
use uuid::Uuid;

use packflow_core::{
    FinalizeStage, FinalizeToken, LeaseToken, Money, MoneyState, PackKind, PackSpec, Run, RunId,
    RunStatus, TenantId,
};

use crate::store::{CasConditions, CasOutcome, RunStore, RunStoreError, RunUpdate};

const RUN_COLUMNS: &str = "run_id, tenant_id, pack_kind, pack_input, timebox_secs, version, \
     status, money_state, finalize_stage, finalize_token, finalize_claimed_at, \
     lease_token, lease_expires_at, reservation_max_cost_micros, actual_cost_micros, \
     minimum_fee_micros, idempotency_key, payload_hash, result_key, result_hash, \
     last_error_reason_code, last_error_detail, retention_until, created_at, updated_at";

/// Postgres-backed run store.
#[derive(Debug, Clone)]
pub struct PostgresRunStore {
    pool: Arc<PgPool>,
}

impl PostgresRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error, run_id: Option<RunId>) -> RunStoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some("23505") {
            if db.constraint() == Some("uq_runs_tenant_idempotency") {
                return RunStoreError::DuplicateIdempotencyKey;
            }
            if let Some(run_id) = run_id {
                return RunStoreError::AlreadyExists(run_id);
            }
        }
    }
    RunStoreError::Storage(format!("{operation}: {err}"))
}

fn parse_enum<T: FromStr>(raw: &str, what: &str) -> Result<T, RunStoreError>
where
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| RunStoreError::Storage(format!("corrupt {what} '{raw}': {e}")))
}

fn row_to_run(row: &PgRow) -> Result<Run, RunStoreError> {
    let get = |e: sqlx::Error| RunStoreError::Storage(format!("row decode: {e}"));

    let status: String = row.try_get("status").map_err(get)?;
    let money_state: String = row.try_get("money_state").map_err(get)?;
    let finalize_stage: String = row.try_get("finalize_stage").map_err(get)?;

    Ok(Run {
        run_id: RunId::from_uuid(row.try_get::<Uuid, _>("run_id").map_err(get)?),
        tenant_id: TenantId::from_uuid(row.try_get::<Uuid, _>("tenant_id").map_err(get)?),
        pack: PackSpec {
            kind: PackKind::new(row.try_get::<String, _>("pack_kind").map_err(get)?),
            input: row.try_get("pack_input").map_err(get)?,
            timebox_secs: row.try_get::<i32, _>("timebox_secs").map_err(get)? as u32,
        },
        version: row.try_get::<i64, _>("version").map_err(get)? as u64,
        status: parse_enum::<RunStatus>(&status, "run status")?,
        money_state: parse_enum::<MoneyState>(&money_state, "money state")?,
        finalize_stage: parse_enum::<FinalizeStage>(&finalize_stage, "finalize stage")?,
        finalize_token: row
            .try_get::<Option<Uuid>, _>("finalize_token")
            .map_err(get)?
            .map(FinalizeToken::from_uuid),
        finalize_claimed_at: row.try_get("finalize_claimed_at").map_err(get)?,
        lease_token: row
            .try_get::<Option<Uuid>, _>("lease_token")
            .map_err(get)?
            .map(LeaseToken::from_uuid),
        lease_expires_at: row.try_get("lease_expires_at").map_err(get)?,
        reservation_max_cost: Money::from_micros(
            row.try_get::<i64, _>("reservation_max_cost_micros").map_err(get)?,
        ),
        actual_cost: row
            .try_get::<Option<i64>, _>("actual_cost_micros")
            .map_err(get)?
            .map(Money::from_micros),
        minimum_fee: Money::from_micros(row.try_get::<i64, _>("minimum_fee_micros").map_err(get)?),
        idempotency_key: row.try_get("idempotency_key").map_err(get)?,
        payload_hash: row.try_get("payload_hash").map_err(get)?,
        result_key: row.try_get("result_key").map_err(get)?,
        result_hash: row.try_get("result_hash").map_err(get)?,
        last_error_reason_code: row.try_get("last_error_reason_code").map_err(get)?,
        last_error_detail: row.try_get("last_error_detail").map_err(get)?,
        retention_until: row.try_get("retention_until").map_err(get)?,
        created_at: row.try_get("created_at").map_err(get)?,
        updated_at: row.try_get("updated_at").map_err(get)?,
    })
}

#[async_trait]
impl RunStore for PostgresRunStore {
    #[instrument(skip(self, run), fields(run_id = %run.run_id, tenant_id = %run.tenant_id), err)]
    async fn create(&self, run: &Run) -> Result<(), RunStoreError> {
        sqlx::query(
            r#"
            INSERT INTO runs (
                run_id, tenant_id, pack_kind, pack_input, timebox_secs, version,
                status, money_state, finalize_stage,
                reservation_max_cost_micros, minimum_fee_micros,
                idempotency_key, payload_hash, retention_until, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(run.run_id.as_uuid())
        .bind(run.tenant_id.as_uuid())
        .bind(run.pack.kind.as_str())
        .bind(&run.pack.input)
        .bind(run.pack.timebox_secs as i32)
        .bind(run.version as i64)
        .bind(run.status.as_str())
        .bind(run.money_state.as_str())
        .bind(run.finalize_stage.as_str())
        .bind(run.reservation_max_cost.as_micros())
        .bind(run.minimum_fee.as_micros())
        .bind(&run.idempotency_key)
        .bind(&run.payload_hash)
        .bind(run.retention_until)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create", e, Some(run.run_id)))?;

        Ok(())
    }

    async fn load(&self, run_id: RunId) -> Result<Option<Run>, RunStoreError> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = $1"))
            .bind(run_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load", e, None))?;

        row.as_ref().map(row_to_run).transpose()
    }

    async fn load_for_tenant(
        &self,
        run_id: RunId,
        tenant_id: TenantId,
    ) -> Result<Option<Run>, RunStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE run_id = $1 AND tenant_id = $2"
        ))
        .bind(run_id.as_uuid())
        .bind(tenant_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_for_tenant", e, None))?;

        row.as_ref().map(row_to_run).transpose()
    }

    async fn find_by_idempotency_key(
        &self,
        tenant_id: TenantId,
        idempotency_key: &str,
    ) -> Result<Option<Run>, RunStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE tenant_id = $1 AND idempotency_key = $2"
        ))
        .bind(tenant_id.as_uuid())
        .bind(idempotency_key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_idempotency_key", e, None))?;

        row.as_ref().map(row_to_run).transpose()
    }

    #[instrument(skip(self, updates, conditions), fields(run_id = %run_id, expected_version), err)]
    async fn cas_update(
        &self,
        run_id: RunId,
        expected_version: u64,
        updates: RunUpdate,
        conditions: CasConditions,
    ) -> Result<CasOutcome, RunStoreError> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("UPDATE runs SET version = version + 1, updated_at = ");
        qb.push_bind(Utc::now());

        if let Some(status) = updates.status {
            qb.push(", status = ").push_bind(status.as_str());
        }
        if let Some(state) = updates.money_state {
            qb.push(", money_state = ").push_bind(state.as_str());
        }
        if let Some(stage) = updates.finalize_stage {
            qb.push(", finalize_stage = ").push_bind(stage.as_str());
        }
        if let Some(token) = updates.finalize_token {
            qb.push(", finalize_token = ").push_bind(*token.as_uuid());
        }
        if let Some(at) = updates.finalize_claimed_at {
            qb.push(", finalize_claimed_at = ").push_bind(at);
        }
        if let Some(token) = updates.lease_token {
            qb.push(", lease_token = ").push_bind(*token.as_uuid());
        }
        if let Some(at) = updates.lease_expires_at {
            qb.push(", lease_expires_at = ").push_bind(at);
        }
        if let Some(cost) = updates.actual_cost {
            qb.push(", actual_cost_micros = ").push_bind(cost.as_micros());
        }
        if let Some(key) = updates.result_key {
            qb.push(", result_key = ").push_bind(key);
        }
        if let Some(hash) = updates.result_hash {
            qb.push(", result_hash = ").push_bind(hash);
        }
        if let Some(code) = updates.last_error_reason_code {
            qb.push(", last_error_reason_code = ").push_bind(code);
        }
        if let Some(detail) = updates.last_error_detail {
            qb.push(", last_error_detail = ").push_bind(detail);
        }

        qb.push(" WHERE run_id = ").push_bind(*run_id.as_uuid());
        qb.push(" AND version = ").push_bind(expected_version as i64);

        if let Some(status) = conditions.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(state) = conditions.money_state {
            qb.push(" AND money_state = ").push_bind(state.as_str());
        }
        if let Some(stage) = conditions.finalize_stage {
            qb.push(" AND finalize_stage = ").push_bind(stage.as_str());
        }
        if let Some(token) = conditions.finalize_token {
            qb.push(" AND finalize_token = ").push_bind(*token.as_uuid());
        }
        if let Some(token) = conditions.lease_token {
            qb.push(" AND lease_token = ").push_bind(*token.as_uuid());
        }
        if let Some(cutoff) = conditions.finalize_claimed_before {
            qb.push(" AND finalize_claimed_at < ").push_bind(cutoff);
        }

        qb.push(" RETURNING ");
        qb.push(RUN_COLUMNS);

        let row = qb
            .build()
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("cas_update", e, None))?;

        match row {
            Some(row) => Ok(CasOutcome::Applied(row_to_run(&row)?)),
            None => Ok(CasOutcome::Stale),
        }
    }

    async fn scan_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Run>, RunStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM runs \
             WHERE status = 'PROCESSING' AND lease_expires_at < $1 \
             ORDER BY lease_expires_at ASC LIMIT $2"
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("scan_expired_leases", e, None))?;

        rows.iter().map(row_to_run).collect()
    }

    async fn scan_stuck_claimed(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Run>, RunStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM runs \
             WHERE finalize_stage = 'CLAIMED' AND finalize_claimed_at < $1 \
             ORDER BY finalize_claimed_at ASC LIMIT $2"
        ))
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("scan_stuck_claimed", e, None))?;

        rows.iter().map(row_to_run).collect()
    }
}
