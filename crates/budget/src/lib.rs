//! Budget engine: atomic reserve / settle / refund against a fast ledger.
//!
//! The entire per-tenant ledger lives in a store with atomic multi-key
//! scripts; every operation here is exactly one such script, so no partial
//! application is ever observable. Two backends are provided:
//!
//! - [`InMemoryBudgetEngine`] for tests and local development,
//! - [`RedisBudgetEngine`] executing Lua scripts against Redis.
//!
//! `settle` is NOT idempotent: the second settle of the same reservation
//! fails with [`BudgetError::NoReservation`], and the finalize protocol
//! relies on that failure as its race detector. Do not make it idempotent.

mod engine;
mod in_memory;
mod redis;

pub use engine::{BudgetEngine, BudgetError, Reservation, ReserveReceipt, Settlement};
pub use in_memory::InMemoryBudgetEngine;
pub use redis::RedisBudgetEngine;
