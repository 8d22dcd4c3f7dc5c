//! Pack executors.
//!
//! One executor per pack kind, registered by name. The core only ever sees
//! the contract: an executor consumes the run's pack spec and produces a
//! result document plus the cost it incurred, bounded by the run's
//! reservation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use packflow_core::{Money, Run};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("no executor registered for pack kind '{0}'")]
    UnknownKind(String),

    #[error("pack execution failed: {0}")]
    Failed(String),

    #[error("pack execution exceeded its timebox of {0}s")]
    Timebox(u32),
}

/// What an executor hands back: the result document and the cost incurred.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutput {
    pub data: serde_json::Value,
    pub actual_cost: Money,
}

/// A pack executor. Implementations must respect the run's timebox and keep
/// `actual_cost` at or below the run's reservation.
#[async_trait]
pub trait PackExecutor: Send + Sync {
    async fn execute(&self, run: &Run) -> Result<ExecutionOutput, ExecutorError>;
}

/// Routes runs to executors by pack kind.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn PackExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: impl Into<String>, executor: Arc<dyn PackExecutor>) -> Self {
        self.executors.insert(kind.into(), executor);
        self
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<dyn PackExecutor>> {
        self.executors.get(kind)
    }

    /// Execute the run with the registered executor, enforcing the timebox.
    pub async fn execute(&self, run: &Run) -> Result<ExecutionOutput, ExecutorError> {
        let executor = self
            .get(run.pack.kind.as_str())
            .ok_or_else(|| ExecutorError::UnknownKind(run.pack.kind.as_str().to_string()))?;

        let timebox = std::time::Duration::from_secs(u64::from(run.pack.timebox_secs));
        match tokio::time::timeout(timebox, executor.execute(run)).await {
            Ok(result) => result,
            Err(_) => Err(ExecutorError::Timebox(run.pack.timebox_secs)),
        }
    }
}

/// Deterministic stand-in executor for the "decision" pack kind.
///
/// Echoes the question back with a canned verdict and charges half the
/// reservation. Real executors (URL fetcher, renderer) plug in through the
/// same trait.
#[derive(Debug, Default)]
pub struct StubDecisionExecutor;

#[async_trait]
impl PackExecutor for StubDecisionExecutor {
    async fn execute(&self, run: &Run) -> Result<ExecutionOutput, ExecutorError> {
        let question = run
            .pack
            .input
            .get("question")
            .and_then(|q| q.as_str())
            .ok_or_else(|| ExecutorError::Failed("input is missing 'question'".to_string()))?;

        Ok(ExecutionOutput {
            data: serde_json::json!({
                "question": question,
                "verdict": "proceed",
                "confidence": 0.72,
            }),
            actual_cost: Money::from_micros(run.reservation_max_cost.as_micros() / 2),
        })
    }
}
