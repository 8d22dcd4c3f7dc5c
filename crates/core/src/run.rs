//! The run record: authoritative state of one asynchronous pack execution.
//!
//! A run carries three orthogonal lifecycle dimensions:
//!
//! - [`RunStatus`] - what the execution is doing (`QUEUED` .. terminal),
//! - [`MoneyState`] - where the reserved money stands on the ledger,
//! - [`FinalizeStage`] - progress through the two-phase finalize handshake.
//!
//! The string values of all three enums are part of the external contract
//! and must not change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{FinalizeToken, LeaseToken, RunId, TenantId};
use crate::money::Money;

/// Execution status of a run.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Expired,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "QUEUED",
            RunStatus::Processing => "PROCESSING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Expired => "EXPIRED",
        }
    }

    /// Terminal statuses are never mutated again (invariant of the
    /// finalize protocol).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Expired
        )
    }
}

impl core::str::FromStr for RunStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(RunStatus::Queued),
            "PROCESSING" => Ok(RunStatus::Processing),
            "COMPLETED" => Ok(RunStatus::Completed),
            "FAILED" => Ok(RunStatus::Failed),
            "EXPIRED" => Ok(RunStatus::Expired),
            other => Err(DomainError::validation(format!("unknown run status: {other}"))),
        }
    }
}

impl core::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger state of the money reserved for a run.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MoneyState {
    None,
    Reserved,
    Settled,
    Refunded,
    AuditRequired,
}

impl MoneyState {
    pub fn as_str(self) -> &'static str {
        match self {
            MoneyState::None => "NONE",
            MoneyState::Reserved => "RESERVED",
            MoneyState::Settled => "SETTLED",
            MoneyState::Refunded => "REFUNDED",
            MoneyState::AuditRequired => "AUDIT_REQUIRED",
        }
    }
}

impl core::str::FromStr for MoneyState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NONE" => Ok(MoneyState::None),
            "RESERVED" => Ok(MoneyState::Reserved),
            "SETTLED" => Ok(MoneyState::Settled),
            "REFUNDED" => Ok(MoneyState::Refunded),
            "AUDIT_REQUIRED" => Ok(MoneyState::AuditRequired),
            other => Err(DomainError::validation(format!("unknown money state: {other}"))),
        }
    }
}

impl core::fmt::Display for MoneyState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress through the two-phase finalize handshake.
///
/// `CLAIMED` never moves back to `UNCLAIMED`; the reconciler only ever
/// forces a stuck claim forward.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalizeStage {
    Unclaimed,
    Claimed,
    Committed,
}

impl FinalizeStage {
    pub fn as_str(self) -> &'static str {
        match self {
            FinalizeStage::Unclaimed => "UNCLAIMED",
            FinalizeStage::Claimed => "CLAIMED",
            FinalizeStage::Committed => "COMMITTED",
        }
    }
}

impl core::str::FromStr for FinalizeStage {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNCLAIMED" => Ok(FinalizeStage::Unclaimed),
            "CLAIMED" => Ok(FinalizeStage::Claimed),
            "COMMITTED" => Ok(FinalizeStage::Committed),
            other => Err(DomainError::validation(format!(
                "unknown finalize stage: {other}"
            ))),
        }
    }
}

impl core::fmt::Display for FinalizeStage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of pack a run executes, used to route to an executor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackKind(String);

impl PackKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for PackKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What to execute: pack kind plus the kind-specific input document.
///
/// The core never interprets `input`; only executors do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackSpec {
    pub kind: PackKind,
    pub input: serde_json::Value,
    /// Maximum execution time granted to the executor, in seconds.
    pub timebox_secs: u32,
}

/// Authoritative record of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub tenant_id: TenantId,
    pub pack: PackSpec,

    /// Optimistic-lock token, incremented by every applied CAS update.
    pub version: u64,

    pub status: RunStatus,
    pub money_state: MoneyState,
    pub finalize_stage: FinalizeStage,

    /// Holder of the finalize claim; set together with `CLAIMED`.
    pub finalize_token: Option<FinalizeToken>,
    pub finalize_claimed_at: Option<DateTime<Utc>>,

    pub lease_token: Option<LeaseToken>,
    pub lease_expires_at: Option<DateTime<Utc>>,

    pub reservation_max_cost: Money,
    pub actual_cost: Option<Money>,
    pub minimum_fee: Money,

    /// Idempotent-submit key, unique per tenant.
    pub idempotency_key: Option<String>,
    /// Hash of the submitted payload; replay requires both key and hash to
    /// match.
    pub payload_hash: String,

    pub result_key: Option<String>,
    pub result_hash: Option<String>,

    pub last_error_reason_code: Option<String>,
    pub last_error_detail: Option<String>,

    pub retention_until: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// Build a freshly-submitted run: `QUEUED / RESERVED / UNCLAIMED`,
    /// version 1. The budget reservation is taken before this record is
    /// created, which is why a new run is already `RESERVED`.
    #[allow(clippy::too_many_arguments)]
    pub fn new_reserved(
        run_id: RunId,
        tenant_id: TenantId,
        pack: PackSpec,
        reservation_max_cost: Money,
        minimum_fee: Money,
        idempotency_key: Option<String>,
        payload_hash: String,
        retention_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            tenant_id,
            pack,
            version: 1,
            status: RunStatus::Queued,
            money_state: MoneyState::Reserved,
            finalize_stage: FinalizeStage::Unclaimed,
            finalize_token: None,
            finalize_claimed_at: None,
            lease_token: None,
            lease_expires_at: None,
            reservation_max_cost,
            actual_cost: None,
            minimum_fee,
            idempotency_key,
            payload_hash,
            result_key: None,
            result_hash: None,
            last_error_reason_code: None,
            last_error_detail: None,
            retention_until,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the worker lease has expired at `now` (reconciler permission
    /// to take over; expiry does not preempt the worker).
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == RunStatus::Processing
            && self.lease_expires_at.is_some_and(|at| at < now)
    }
}
