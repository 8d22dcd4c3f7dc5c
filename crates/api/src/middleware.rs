//! Tenant-context middleware.
//!
//! API-key auth and tenant resolution happen at the gateway in front of
//! this service; by the time a request lands here, the gateway has already
//! mapped the caller's credentials to a tenant and stamped `X-Tenant-Id`.
//! Requests without a parseable tenant id never reach a handler.

use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;

use packflow_core::TenantId;

use crate::app::errors::json_error;
use crate::context::TenantContext;

pub const TENANT_HEADER: &str = "x-tenant-id";

pub async fn tenant_middleware(mut request: Request, next: Next) -> Response {
    let tenant_id = request
        .headers()
        .get(TENANT_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.parse::<TenantId>().ok());

    let Some(tenant_id) = tenant_id else {
        return json_error(
            StatusCode::UNAUTHORIZED,
            "unauthenticated",
            "missing or invalid tenant identity",
        );
    };

    request
        .extensions_mut()
        .insert(TenantContext::new(tenant_id));
    next.run(request).await
}
