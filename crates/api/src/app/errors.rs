use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use packflow_lifecycle::SubmitError;

pub fn submit_error_to_response(err: SubmitError) -> axum::response::Response {
    match err {
        SubmitError::BudgetExceeded { requested, available } => json_error(
            StatusCode::PAYMENT_REQUIRED,
            "BUDGET_EXCEEDED",
            format!("requested {requested}, available {available}"),
        ),
        SubmitError::IdempotencyConflict => json_error(
            StatusCode::CONFLICT,
            "idempotency_conflict",
            "idempotency key already used with a different payload",
        ),
        SubmitError::Validation(e) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
        }
        SubmitError::Queue(e) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "enqueue_failed", e.to_string())
        }
        SubmitError::Store(e) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            e.to_string(),
        ),
        SubmitError::Budget(e) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "budget_error",
            e.to_string(),
        ),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
