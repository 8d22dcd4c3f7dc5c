//! The worker loop: dequeue, lease, execute, upload, finalize.

use chrono::Utc;
use tracing::{error, info, instrument, warn};

use packflow_budget::BudgetEngine;
use packflow_core::{LeaseToken, Run, RunStatus, Timings};
use packflow_infra::{artifact_key, ArtifactMetadata, DispatchQueue, ObjectStore, QueuedMessage};
use packflow_lifecycle::{FinalizeError, FinalizeOutcome, Finalizer, SuccessResult};
use packflow_runstore::{CasConditions, CasOutcome, RunStore, RunUpdate};

use crate::envelope::{build_envelope, envelope_sha256};
use crate::executor::{ExecutorError, ExecutorRegistry};

const REASON_EXECUTION_FAILED: &str = "PACK_EXECUTION_FAILED";
const REASON_TIMEBOX_EXCEEDED: &str = "PACK_TIMEBOX_EXCEEDED";
const REASON_METADATA_MISMATCH: &str = "RESULT_METADATA_MISMATCH";

/// One worker's processing loop.
pub struct WorkerLoop<S, B, O, Q> {
    run_store: S,
    objects: O,
    queue: Q,
    executors: ExecutorRegistry,
    finalizer: Finalizer<S, B>,
    timings: Timings,
}

impl<S, B, O, Q> WorkerLoop<S, B, O, Q>
where
    S: RunStore + Clone,
    B: BudgetEngine,
    O: ObjectStore,
    Q: DispatchQueue,
{
    pub fn new(
        run_store: S,
        budget: B,
        objects: O,
        queue: Q,
        executors: ExecutorRegistry,
        timings: Timings,
    ) -> Self {
        let finalizer = Finalizer::new(run_store.clone(), budget);
        Self {
            run_store,
            objects,
            queue,
            executors,
            finalizer,
            timings,
        }
    }

    /// Poll once and process at most one message. Returns whether a message
    /// was handled (used by tests; the loop itself doesn't care).
    pub async fn run_once(&self) -> bool {
        let received = match self
            .queue
            .receive(self.timings.max_io_timeout(), self.timings.lease_ttl())
            .await
        {
            Ok(Some(received)) => received,
            Ok(None) => return false,
            Err(e) => {
                error!(error = %e, "queue receive failed");
                return false;
            }
        };

        match self.process(&received).await {
            Ok(()) => {
                if let Err(e) = self.queue.ack(&received.receipt).await {
                    // At-least-once: the redelivery will be skipped by the
                    // status check.
                    warn!(error = %e, "ack failed; expecting redelivery");
                }
            }
            Err(e) => {
                // Leave the message for redelivery after the visibility
                // timeout; the reaper covers the run either way.
                error!(run_id = %received.message.run_id, error = %e, "message processing failed");
            }
        }
        true
    }

    /// Poll and process forever.
    pub async fn run_forever(&self) {
        info!("worker loop started");
        loop {
            self.run_once().await;
        }
    }

    #[instrument(skip(self, received), fields(run_id = %received.message.run_id), err)]
    async fn process(&self, received: &QueuedMessage) -> Result<(), FinalizeError> {
        let message = &received.message;

        let Some(run) = self.run_store.load(message.run_id).await? else {
            warn!("dispatch message for unknown run; dropping");
            return Ok(());
        };

        if run.status != RunStatus::Queued {
            // Redelivery of an in-flight or finished run.
            info!(status = %run.status, "run is not QUEUED; dropping stale message");
            return Ok(());
        }

        // Acquire the visibility lease. Losing this CAS means another
        // worker got the run first.
        let lease_token = LeaseToken::mint();
        let lease_ttl = chrono::Duration::seconds(message.lease_ttl_seconds as i64);
        let leased = match self
            .run_store
            .cas_update(
                run.run_id,
                run.version,
                RunUpdate::new()
                    .status(RunStatus::Processing)
                    .lease(lease_token, Utc::now() + lease_ttl),
                CasConditions::new().status(RunStatus::Queued),
            )
            .await?
        {
            CasOutcome::Applied(run) => run,
            CasOutcome::Stale => {
                info!("lost lease race; dropping message");
                return Ok(());
            }
        };

        match self.executors.execute(&leased).await {
            Ok(output) => self.finish_success(&leased, lease_token, output).await,
            Err(e) => {
                let reason = match &e {
                    ExecutorError::Timebox(_) => REASON_TIMEBOX_EXCEEDED,
                    _ => REASON_EXECUTION_FAILED,
                };
                warn!(error = %e, "execution failed; finalizing on the refund path");
                self.finish_failure(&leased, lease_token, reason, &e.to_string())
                    .await
            }
        }
    }

    async fn finish_success(
        &self,
        run: &Run,
        lease_token: LeaseToken,
        output: crate::executor::ExecutionOutput,
    ) -> Result<(), FinalizeError> {
        let bytes = build_envelope(run, &output.data, output.actual_cost, Utc::now());
        let hash = envelope_sha256(&bytes);
        let key = artifact_key(run.run_id);
        let size_bytes = bytes.len() as u64;

        let metadata = ArtifactMetadata {
            actual_cost: output.actual_cost,
            sha256: hash.clone(),
            size_bytes,
        };

        if let Err(e) = self.objects.put(&key, bytes, metadata).await {
            warn!(error = %e, "artifact upload failed; finalizing on the refund path");
            return self
                .finish_failure(run, lease_token, REASON_EXECUTION_FAILED, &e.to_string())
                .await;
        }

        // The stored metadata is what the reconciler would recover from;
        // if it doesn't match what we just wrote, trusting it would be
        // worse than charging the minimum fee.
        match self.objects.head(&key).await {
            Ok(Some(stored)) if stored.sha256 == hash && stored.size_bytes == size_bytes => {}
            Ok(_) => {
                warn!("uploaded artifact metadata is inconsistent; treating as failure");
                return self
                    .finish_failure(
                        run,
                        lease_token,
                        REASON_METADATA_MISMATCH,
                        "artifact metadata does not match uploaded envelope",
                    )
                    .await;
            }
            Err(e) => {
                warn!(error = %e, "artifact metadata readback failed; treating as failure");
                return self
                    .finish_failure(run, lease_token, REASON_EXECUTION_FAILED, &e.to_string())
                    .await;
            }
        }

        let outcome = self
            .finalizer
            .finalize_success(
                run,
                lease_token,
                SuccessResult {
                    result_key: key,
                    result_hash: hash,
                    actual_cost: output.actual_cost,
                },
            )
            .await?;

        match outcome {
            FinalizeOutcome::Winner(done) => {
                info!(run_id = %done.run_id, actual_cost = %output.actual_cost, "run completed");
            }
            FinalizeOutcome::LostRace => {
                info!(run_id = %run.run_id, "finalize lost race; another actor finished the run");
            }
        }
        Ok(())
    }

    async fn finish_failure(
        &self,
        run: &Run,
        lease_token: LeaseToken,
        reason_code: &str,
        detail: &str,
    ) -> Result<(), FinalizeError> {
        let outcome = self
            .finalizer
            .finalize_failure(run, lease_token, reason_code, detail)
            .await?;

        match outcome {
            FinalizeOutcome::Winner(done) => {
                info!(run_id = %done.run_id, reason = reason_code, "run failed and refunded");
            }
            FinalizeOutcome::LostRace => {
                info!(run_id = %run.run_id, "failure finalize lost race");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use packflow_budget::{BudgetEngine, InMemoryBudgetEngine};
    use packflow_core::{Money, MoneyState, PackKind, PackSpec, TenantId};
    use packflow_infra::{DispatchMessage, InMemoryDispatchQueue, InMemoryObjectStore};
    use packflow_lifecycle::{SubmitRequest, Submitter, SubmitterConfig};
    use packflow_runstore::InMemoryRunStore;

    use crate::executor::StubDecisionExecutor;

    struct Rig {
        store: Arc<InMemoryRunStore>,
        budget: Arc<InMemoryBudgetEngine>,
        queue: Arc<InMemoryDispatchQueue>,
        submitter: Submitter<Arc<InMemoryRunStore>, Arc<InMemoryBudgetEngine>, Arc<InMemoryDispatchQueue>>,
        worker: WorkerLoop<
            Arc<InMemoryRunStore>,
            Arc<InMemoryBudgetEngine>,
            Arc<InMemoryObjectStore>,
            Arc<InMemoryDispatchQueue>,
        >,
    }

    fn rig() -> Rig {
        let timings = Timings::default();
        let store = Arc::new(InMemoryRunStore::new());
        let budget = Arc::new(InMemoryBudgetEngine::new(timings.t_res()));
        let objects = Arc::new(InMemoryObjectStore::new());
        let queue = Arc::new(InMemoryDispatchQueue::new());

        let submitter = Submitter::new(
            store.clone(),
            budget.clone(),
            queue.clone(),
            timings,
            SubmitterConfig::default(),
        );
        let executors = ExecutorRegistry::new()
            .register("decision", Arc::new(StubDecisionExecutor));
        let worker = WorkerLoop::new(
            store.clone(),
            budget.clone(),
            objects,
            queue.clone(),
            executors,
            timings,
        );

        Rig {
            store,
            budget,
            queue,
            submitter,
            worker,
        }
    }

    async fn submit(rig: &Rig, tenant: TenantId, input: serde_json::Value) -> Run {
        rig.submitter
            .submit(SubmitRequest {
                tenant_id: tenant,
                pack: PackSpec {
                    kind: PackKind::new("decision"),
                    input,
                    timebox_secs: 30,
                },
                max_cost: Money::parse("1.0000").unwrap(),
                idempotency_key: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn worker_drives_a_run_to_completed() {
        let rig = rig();
        let tenant = TenantId::new();
        rig.budget
            .set_balance(tenant, Money::parse("10.0000").unwrap())
            .await
            .unwrap();

        let run = submit(&rig, tenant, serde_json::json!({"question": "ship it?"})).await;
        assert!(rig.worker.run_once().await);

        let done = rig.store.load(run.run_id).await.unwrap().unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.money_state, MoneyState::Settled);
        // Stub charges half the 1.0000 reservation.
        assert_eq!(done.actual_cost, Some(Money::parse("0.5000").unwrap()));
        assert!(done.result_key.is_some());
        assert!(done.result_hash.is_some());

        assert_eq!(
            rig.budget.balance(tenant).await.unwrap(),
            Money::parse("9.5000").unwrap()
        );
        assert_eq!(rig.queue.depth(), 0);
    }

    #[tokio::test]
    async fn executor_failure_takes_the_refund_path() {
        let rig = rig();
        let tenant = TenantId::new();
        rig.budget
            .set_balance(tenant, Money::parse("10.0000").unwrap())
            .await
            .unwrap();

        // No 'question' key: the stub executor fails.
        let run = submit(&rig, tenant, serde_json::json!({"mode": "brief"})).await;
        assert!(rig.worker.run_once().await);

        let done = rig.store.load(run.run_id).await.unwrap().unwrap();
        assert_eq!(done.status, RunStatus::Failed);
        assert_eq!(done.money_state, MoneyState::Refunded);
        assert_eq!(
            done.last_error_reason_code.as_deref(),
            Some(REASON_EXECUTION_FAILED)
        );
        // Charged only the minimum fee (2% of 1.0000).
        assert_eq!(done.actual_cost, Some(Money::parse("0.0200").unwrap()));
        assert_eq!(
            rig.budget.balance(tenant).await.unwrap(),
            Money::parse("9.9800").unwrap()
        );
    }

    #[tokio::test]
    async fn stale_redelivery_is_dropped() {
        let rig = rig();
        let tenant = TenantId::new();
        rig.budget
            .set_balance(tenant, Money::parse("10.0000").unwrap())
            .await
            .unwrap();

        let run = submit(&rig, tenant, serde_json::json!({"question": "ship it?"})).await;
        assert!(rig.worker.run_once().await);
        let done = rig.store.load(run.run_id).await.unwrap().unwrap();
        let settled_version = done.version;

        // Simulate a duplicate delivery of the same dispatch message.
        rig.queue
            .enqueue(DispatchMessage {
                run_id: run.run_id,
                tenant_id: tenant,
                pack_kind: run.pack.kind.clone(),
                lease_ttl_seconds: 360,
            })
            .await
            .unwrap();
        assert!(rig.worker.run_once().await);

        // Nothing moved: same version, same terminal state, message gone.
        let after = rig.store.load(run.run_id).await.unwrap().unwrap();
        assert_eq!(after.version, settled_version);
        assert_eq!(rig.queue.depth(), 0);
    }
}
