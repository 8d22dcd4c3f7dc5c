use axum::Router;

pub mod runs;
pub mod system;

pub fn router() -> Router {
    Router::new().nest("/v1/runs", runs::router())
}
