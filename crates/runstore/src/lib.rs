//! Run store: durable, linearizable log of run records.
//!
//! After creation, the ONLY mutation primitive is [`RunStore::cas_update`]:
//! a single-row compare-and-set on the run's version plus optional extra
//! conditions. Every higher-level transition (lease acquisition, finalize
//! claim, terminal commit) composes CAS operations with external side
//! effects between them; the store itself never blocks on anything but its
//! backing storage.

mod in_memory;
mod postgres;
mod store;

pub use in_memory::InMemoryRunStore;
pub use postgres::PostgresRunStore;
pub use store::{CasConditions, CasOutcome, RunStore, RunStoreError, RunUpdate};
