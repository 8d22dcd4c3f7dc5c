//! HTTP frontend for packflow.
//!
//! Handlers validate the boundary (money strings, header shape), then call
//! into `packflow_lifecycle` with typed commands - nothing else. Tenant
//! resolution is an upstream concern - requests arrive with an
//! already-resolved `X-Tenant-Id` set by the API gateway.

pub mod app;
pub mod context;
pub mod middleware;
