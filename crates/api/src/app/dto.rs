//! Request/response DTOs.
//!
//! Money crosses this boundary as fixed 4-decimal strings and nothing else;
//! parsing rejects extra precision before any core code runs.

use serde::{Deserialize, Serialize};

use packflow_core::{Money, Run};

#[derive(Debug, Deserialize)]
pub struct RunCreateRequest {
    pub pack_kind: String,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default = "default_timebox_secs")]
    pub timebox_secs: u32,
    /// Maximum cost to reserve, wire form (e.g. `"1.5000"`).
    pub max_cost: String,
}

fn default_timebox_secs() -> u32 {
    90
}

#[derive(Debug, Serialize)]
pub struct PollInfo {
    pub href: String,
    pub recommended_interval_ms: u32,
    pub max_wait_secs: u32,
}

#[derive(Debug, Serialize)]
pub struct ReservationInfo {
    pub max_cost: String,
}

/// 202 response for an accepted submit.
#[derive(Debug, Serialize)]
pub struct RunReceipt {
    pub run_id: String,
    pub status: String,
    pub poll: PollInfo,
    pub reservation: ReservationInfo,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct CostInfo {
    pub reserved: String,
    pub used: String,
    pub minimum_fee: String,
    pub balance_remaining: String,
}

#[derive(Debug, Serialize)]
pub struct ResultInfo {
    pub url: Option<String>,
    pub sha256: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorInfo {
    pub reason_code: String,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub struct RunStatusResponse {
    pub run_id: String,
    pub status: String,
    pub money_state: String,
    pub cost: CostInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub created_at: String,
    pub updated_at: String,
}

pub fn receipt_from_run(run: &Run) -> RunReceipt {
    RunReceipt {
        run_id: run.run_id.to_string(),
        status: run.status.as_str().to_string(),
        poll: PollInfo {
            href: format!("/v1/runs/{}", run.run_id),
            recommended_interval_ms: 1500,
            max_wait_secs: 90,
        },
        reservation: ReservationInfo {
            max_cost: run.reservation_max_cost.to_string(),
        },
        created_at: run.created_at.to_rfc3339(),
    }
}

pub fn cost_info(run: &Run, balance: Money) -> CostInfo {
    CostInfo {
        reserved: run.reservation_max_cost.to_string(),
        used: run.actual_cost.unwrap_or(Money::ZERO).to_string(),
        minimum_fee: run.minimum_fee.to_string(),
        balance_remaining: balance.to_string(),
    }
}
