//! Worker: executes packs and finalizes runs.
//!
//! The loop long-polls the dispatch queue, acquires a visibility lease via
//! CAS, routes the run to a [`PackExecutor`], uploads the result envelope
//! with its cost metadata, and finishes through the two-phase finalize
//! protocol. Everything that can lose a race does so silently; everything
//! that crashes is picked up later by the reaper.

pub mod envelope;
pub mod executor;
pub mod worker;

pub use envelope::{build_envelope, envelope_sha256};
pub use executor::{
    ExecutionOutput, ExecutorError, ExecutorRegistry, PackExecutor, StubDecisionExecutor,
};
pub use worker::WorkerLoop;
