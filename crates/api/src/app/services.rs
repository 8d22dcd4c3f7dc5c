//! Service wiring: shared handles into the lifecycle core.
//!
//! Handlers see trait objects only, so the same router serves the
//! Postgres/Redis/S3 production wiring and the all-in-memory test wiring.

use std::sync::Arc;

use packflow_budget::BudgetEngine;
use packflow_core::Timings;
use packflow_infra::{DispatchQueue, ObjectStore};
use packflow_lifecycle::{Submitter, SubmitterConfig};
use packflow_runstore::RunStore;

pub type SharedRunStore = Arc<dyn RunStore>;
pub type SharedBudget = Arc<dyn BudgetEngine>;
pub type SharedQueue = Arc<dyn DispatchQueue>;
pub type SharedObjects = Arc<dyn ObjectStore>;

/// Everything a request handler needs.
pub struct AppServices {
    pub submitter: Submitter<SharedRunStore, SharedBudget, SharedQueue>,
    pub run_store: SharedRunStore,
    pub budget: SharedBudget,
    pub objects: SharedObjects,
}

impl AppServices {
    pub fn new(
        run_store: SharedRunStore,
        budget: SharedBudget,
        queue: SharedQueue,
        objects: SharedObjects,
        timings: Timings,
        config: SubmitterConfig,
    ) -> Self {
        let submitter = Submitter::new(
            run_store.clone(),
            budget.clone(),
            queue,
            timings,
            config,
        );
        Self {
            submitter,
            run_store,
            budget,
            objects,
        }
    }
}
