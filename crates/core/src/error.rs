//! Domain error model.
//!
//! Domain errors represent deterministic business failures - validation,
//! invariant violations, conflicts. Infrastructure failures (network,
//! database) belong to the store crates' own error types. Race outcomes
//! (a lost CAS, a missing reservation) are not errors in this taxonomy:
//! the lifecycle crate models them as ordinary return values because they
//! carry no actionable information for a caller.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error (business logic failures).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated (e.g. settling a run whose money
    /// state is not RESERVED).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found (or is not visible to the caller).
    #[error("not found")]
    NotFound,

    /// The resource existed but its retention window has passed.
    #[error("gone")]
    Gone,

    /// A conflict occurred (e.g. idempotency key reused with a different
    /// payload).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }
}
