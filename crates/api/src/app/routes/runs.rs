use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;

use packflow_core::{Money, PackKind, PackSpec, RunId, RunStatus};
use packflow_lifecycle::SubmitRequest;

use crate::app::errors::{json_error, submit_error_to_response};
use crate::app::services::AppServices;
use crate::app::dto;
use crate::context::TenantContext;

/// How long presigned result links stay valid.
const RESULT_URL_TTL: Duration = Duration::from_secs(900);

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_run))
        .route("/:run_id", get(get_run))
}

pub async fn create_run(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    headers: HeaderMap,
    Json(body): Json<dto::RunCreateRequest>,
) -> axum::response::Response {
    let Some(idempotency_key) = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "Idempotency-Key header is required",
        );
    };

    let max_cost = match Money::parse(&body.max_cost) {
        Ok(amount) => amount,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
    };
    if body.pack_kind.trim().is_empty() {
        return json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "pack_kind must be set",
        );
    }

    let request = SubmitRequest {
        tenant_id: tenant.tenant_id(),
        pack: PackSpec {
            kind: PackKind::new(body.pack_kind),
            input: body.input,
            timebox_secs: body.timebox_secs,
        },
        max_cost,
        idempotency_key: Some(idempotency_key),
    };

    match services.submitter.submit(request).await {
        Ok(run) => (
            StatusCode::ACCEPTED,
            Json(dto::receipt_from_run(&run)),
        )
            .into_response(),
        Err(e) => submit_error_to_response(e),
    }
}

pub async fn get_run(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(run_id): Path<String>,
) -> axum::response::Response {
    let Ok(run_id) = run_id.parse::<RunId>() else {
        // Unparseable ids get the same stealth 404 as foreign runs.
        return json_error(StatusCode::NOT_FOUND, "not_found", "run not found");
    };

    let run = match services
        .run_store
        .load_for_tenant(run_id, tenant.tenant_id())
        .await
    {
        Ok(Some(run)) => run,
        Ok(None) => {
            return json_error(StatusCode::NOT_FOUND, "not_found", "run not found")
        }
        Err(e) => {
            return json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "store_error",
                e.to_string(),
            )
        }
    };

    if run.retention_until < Utc::now() {
        return json_error(StatusCode::GONE, "gone", "run result has expired");
    }

    let balance = match services.budget.balance(tenant.tenant_id()).await {
        Ok(balance) => balance,
        Err(e) => {
            return json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "budget_error",
                e.to_string(),
            )
        }
    };

    let result = match (&run.status, &run.result_key) {
        (RunStatus::Completed, Some(key)) => {
            let url = services
                .objects
                .presign_get(key, RESULT_URL_TTL)
                .await
                .unwrap_or_default();
            Some(dto::ResultInfo {
                url,
                sha256: run.result_hash.clone(),
            })
        }
        _ => None,
    };

    let error = run
        .last_error_reason_code
        .as_ref()
        .map(|reason_code| dto::ErrorInfo {
            reason_code: reason_code.clone(),
            detail: run.last_error_detail.clone().unwrap_or_default(),
        });

    let response = dto::RunStatusResponse {
        run_id: run.run_id.to_string(),
        status: run.status.as_str().to_string(),
        money_state: run.money_state.as_str().to_string(),
        cost: dto::cost_info(&run, balance),
        result,
        error,
        created_at: run.created_at.to_rfc3339(),
        updated_at: run.updated_at.to_rfc3339(),
    };

    (StatusCode::OK, Json(response)).into_response()
}
