//! HTTP application wiring (axum router + service wiring).
//!
//! - `services.rs`: shared handles into the lifecycle core
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs with wire-form money strings
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the full HTTP router around an assembled service set.
pub fn build_router(services: Arc<AppServices>) -> Router {
    let protected = routes::router()
        .layer(Extension(services))
        .layer(axum::middleware::from_fn(middleware::tenant_middleware));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
}
