//! Run lifecycle coordination: submission, exactly-once finalize, and the
//! reconciliation loop.
//!
//! Three independent actors (API frontend, worker, reaper) race on the same
//! run record. The rules that keep money exact under that race:
//!
//! - the run store's CAS is the only way to mutate a run,
//! - the budget engine's non-idempotent settle is the uniqueness witness -
//!   exactly one settle per reservation ever succeeds,
//! - every terminal transition goes through the two-phase claim/commit
//!   handshake in [`finalize`],
//! - the [`reconciler`] drives any run abandoned between phases to a
//!   terminal state without double-charging.

pub mod finalize;
pub mod reconciler;
pub mod submission;

pub use finalize::{FinalizeError, FinalizeOutcome, Finalizer, SuccessResult};
pub use reconciler::{resolve_audit, Reconciler, SweepStats};
pub use submission::{SubmitError, SubmitRequest, Submitter, SubmitterConfig};
