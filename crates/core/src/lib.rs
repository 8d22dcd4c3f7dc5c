//! Core domain types for the packflow run lifecycle.
//!
//! Everything in this crate is pure data: typed identifiers, integer money,
//! the run record with its three lifecycle dimensions (status, money state,
//! finalize stage), and the timing configuration that couples the lease,
//! reservation, and reconciler clocks. Storage and protocol logic live in
//! the `packflow_runstore`, `packflow_budget`, and `packflow_lifecycle`
//! crates.

pub mod error;
pub mod id;
pub mod money;
pub mod run;
pub mod timings;

pub use error::{DomainError, DomainResult};
pub use id::{FinalizeToken, LeaseToken, RunId, TenantId};
pub use money::{Money, MoneyError};
pub use run::{FinalizeStage, MoneyState, PackKind, PackSpec, Run, RunStatus};
pub use timings::{Timings, TimingsError};
