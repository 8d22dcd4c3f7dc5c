//! End-to-end lifecycle scenarios over the in-memory backends: submission,
//! worker finalize, reaper takeover, and the reconciler's recovery paths,
//! with the money-conservation invariant checked along the way.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use packflow_budget::{BudgetEngine, InMemoryBudgetEngine};
use packflow_core::{
    FinalizeStage, FinalizeToken, LeaseToken, Money, MoneyState, PackKind, PackSpec, Run,
    RunStatus, TenantId, Timings,
};
use packflow_infra::{
    artifact_key, ArtifactMetadata, DispatchQueue, InMemoryDispatchQueue, InMemoryObjectStore,
    ObjectStore, QueueError,
};
use packflow_lifecycle::{
    resolve_audit, FinalizeOutcome, Finalizer, Reconciler, SubmitError, SubmitRequest, Submitter,
    SubmitterConfig, SuccessResult,
};
use packflow_runstore::{CasConditions, InMemoryRunStore, RunStore, RunUpdate};

type Store = Arc<InMemoryRunStore>;
type Budget = Arc<InMemoryBudgetEngine>;
type Objects = Arc<InMemoryObjectStore>;
type Queue = Arc<InMemoryDispatchQueue>;

struct Harness {
    store: Store,
    budget: Budget,
    objects: Objects,
    queue: Queue,
    timings: Timings,
    submitter: Submitter<Store, Budget, Queue>,
    finalizer: Finalizer<Store, Budget>,
    reconciler: Reconciler<Store, Budget, Objects>,
}

impl Harness {
    fn new() -> Self {
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
        let finalizer = Finalizer::new(store.clone(), budget.clone());
        let reconciler = Reconciler::new(store.clone(), budget.clone(), objects.clone(), timings);

        Self {
            store,
            budget,
            objects,
            queue,
            timings,
            submitter,
            finalizer,
            reconciler,
        }
    }

    async fn tenant_with_balance(&self, display: &str) -> TenantId {
        let tenant = TenantId::new();
        self.budget
            .set_balance(tenant, Money::parse(display).unwrap())
            .await
            .unwrap();
        tenant
    }

    async fn submit(&self, tenant: TenantId, max_cost: &str, key: Option<&str>) -> Run {
        self.submitter
            .submit(SubmitRequest {
                tenant_id: tenant,
                pack: decision_pack(),
                max_cost: Money::parse(max_cost).unwrap(),
                idempotency_key: key.map(str::to_string),
            })
            .await
            .unwrap()
    }

    /// What a worker does when it picks up the dispatch message.
    async fn acquire_lease(&self, run: &Run) -> (Run, LeaseToken) {
        let token = LeaseToken::mint();
        let leased = self
            .store
            .cas_update(
                run.run_id,
                run.version,
                RunUpdate::new()
                    .status(RunStatus::Processing)
                    .lease(token, Utc::now() + self.timings.lease_ttl_chrono()),
                CasConditions::new().status(RunStatus::Queued),
            )
            .await
            .unwrap()
            .into_applied()
            .expect("lease CAS must apply on a fresh run");
        (leased, token)
    }

    /// Force the lease into the past so the reaper sweep sees it.
    async fn expire_lease(&self, run: &Run) -> Run {
        self.store
            .cas_update(
                run.run_id,
                run.version,
                RunUpdate::new().lease(
                    run.lease_token.expect("run must be leased"),
                    Utc::now() - chrono::Duration::seconds(1),
                ),
                CasConditions::new().status(RunStatus::Processing),
            )
            .await
            .unwrap()
            .into_applied()
            .unwrap()
    }

    /// Upload a result artifact the way the worker does, metadata included.
    async fn upload_artifact(&self, run: &Run, cost: &str) -> SuccessResult {
        let bytes = br#"{"data":{"answer":42}}"#.to_vec();
        let hash = "9d2b".to_string();
        let key = artifact_key(run.run_id);
        self.objects
            .put(
                &key,
                bytes.clone(),
                ArtifactMetadata {
                    actual_cost: Money::parse(cost).unwrap(),
                    sha256: hash.clone(),
                    size_bytes: bytes.len() as u64,
                },
            )
            .await
            .unwrap();
        SuccessResult {
            result_key: key,
            result_hash: hash,
            actual_cost: Money::parse(cost).unwrap(),
        }
    }

    /// Park a leased run in CLAIMED with a back-dated claim, simulating an
    /// actor that claimed and then died `age` ago.
    async fn strand_claim(&self, run: &Run, age: chrono::Duration) -> (Run, FinalizeToken) {
        let token = FinalizeToken::mint();
        let claimed = self
            .store
            .cas_update(
                run.run_id,
                run.version,
                RunUpdate::new()
                    .finalize_stage(FinalizeStage::Claimed)
                    .finalize_token(token)
                    .finalize_claimed_at(Utc::now() - age),
                CasConditions::new().finalize_stage(FinalizeStage::Unclaimed),
            )
            .await
            .unwrap()
            .into_applied()
            .unwrap();
        (claimed, token)
    }

    async fn reload(&self, run: &Run) -> Run {
        self.store.load(run.run_id).await.unwrap().unwrap()
    }

    async fn balance(&self, tenant: TenantId) -> String {
        self.budget.balance(tenant).await.unwrap().to_string()
    }
}

fn decision_pack() -> PackSpec {
    PackSpec {
        kind: PackKind::new("decision"),
        input: serde_json::json!({"question": "ship it?", "mode": "brief"}),
        timebox_secs: 90,
    }
}

// S1: submit, execute, settle. Balance drops by the actual cost only.
#[tokio::test]
async fn happy_path_settles_actual_cost() {
    let h = Harness::new();
    let tenant = h.tenant_with_balance("10.0000").await;

    let run = h.submit(tenant, "1.5000", Some("key-s1-00001")).await;
    assert_eq!(run.status, RunStatus::Queued);
    assert_eq!(run.money_state, MoneyState::Reserved);
    assert_eq!(h.queue.depth(), 1);
    assert_eq!(h.balance(tenant).await, "8.5000");

    let message = h
        .queue
        .receive(Duration::from_millis(100), Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.message.run_id, run.run_id);

    let (leased, lease) = h.acquire_lease(&run).await;
    let result = h.upload_artifact(&leased, "1.0000").await;

    let outcome = h
        .finalizer
        .finalize_success(&leased, lease, result)
        .await
        .unwrap();
    let FinalizeOutcome::Winner(done) = outcome else {
        panic!("uncontended finalize must win");
    };

    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(done.money_state, MoneyState::Settled);
    assert_eq!(done.finalize_stage, FinalizeStage::Committed);
    assert_eq!(done.actual_cost, Some(Money::parse("1.0000").unwrap()));
    assert!(done.result_key.is_some());
    assert_eq!(h.balance(tenant).await, "9.0000");
    assert_eq!(h.budget.open_reservations(), 0);
}

// S2: worker and reaper race on phase 1. Exactly one claim applies and the
// ledger sees exactly one settle.
#[tokio::test]
async fn claim_race_admits_exactly_one_winner() {
    let h = Harness::new();
    let tenant = h.tenant_with_balance("10.0000").await;

    let run = h.submit(tenant, "1.0000", None).await;
    let (leased, lease) = h.acquire_lease(&run).await;
    let leased = h.expire_lease(&leased).await;
    let result = h.upload_artifact(&leased, "0.8000").await;

    let worker = h.finalizer.finalize_success(&leased, lease, result);
    let reaper = h.finalizer.finalize_expired(&leased);
    let (worker_outcome, reaper_outcome) = tokio::join!(worker, reaper);

    let worker_won = worker_outcome.unwrap().is_winner();
    let reaper_won = reaper_outcome.unwrap().is_winner();
    assert!(worker_won ^ reaper_won, "exactly one actor must win");

    let done = h.reload(&run).await;
    assert_eq!(done.finalize_stage, FinalizeStage::Committed);
    assert!(done.is_terminal());
    assert_eq!(h.budget.open_reservations(), 0);

    // The balance reflects whichever single settle happened.
    let expected = if worker_won { "9.2000" } else { "9.9800" };
    assert_eq!(h.balance(tenant).await, expected);
    assert_eq!(
        done.actual_cost,
        Some(Money::parse(if worker_won { "0.8000" } else { "0.0200" }).unwrap())
    );
}

// S3: worker settles, dies before commit. Case B rolls the log forward with
// the cost recovered from artifact metadata.
#[tokio::test]
async fn force_settle_recovers_cost_from_artifact_metadata() {
    let h = Harness::new();
    let tenant = h.tenant_with_balance("10.0000").await;

    let run = h.submit(tenant, "1.5000", None).await;
    let (leased, _lease) = h.acquire_lease(&run).await;
    h.upload_artifact(&leased, "1.0000").await;
    let (claimed, _token) = h.strand_claim(&leased, chrono::Duration::minutes(10)).await;

    // The settle the dead worker got through; balance is already right.
    h.budget
        .settle(tenant, run.run_id, Money::parse("1.0000").unwrap())
        .await
        .unwrap();
    assert_eq!(h.balance(tenant).await, "9.0000");

    let stats = h.reconciler.sweep_once().await;
    assert_eq!(stats.stuck_rolled_forward, 1);
    assert_eq!(stats.failures, 0);

    let done = h.reload(&claimed).await;
    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(done.money_state, MoneyState::Settled);
    assert_eq!(done.finalize_stage, FinalizeStage::Committed);
    assert_eq!(done.actual_cost, Some(Money::parse("1.0000").unwrap()));
    assert_eq!(h.balance(tenant).await, "9.0000");

    // Idempotent: a second sweep finds nothing to do.
    let stats = h.reconciler.sweep_once().await;
    assert_eq!(stats, Default::default());
}

// S4: worker dies before claiming. The reaper refunds down to the minimum
// fee and the run expires.
#[tokio::test]
async fn expired_lease_is_reaped_for_the_minimum_fee() {
    let h = Harness::new();
    let tenant = h.tenant_with_balance("10.0000").await;

    // 2% of 0.5000 = the spec's 0.0100 minimum fee.
    let run = h.submit(tenant, "0.5000", None).await;
    assert_eq!(run.minimum_fee, Money::parse("0.0100").unwrap());

    let (leased, _lease) = h.acquire_lease(&run).await;
    h.expire_lease(&leased).await;

    let stats = h.reconciler.sweep_once().await;
    assert_eq!(stats.expired_reaped, 1);

    let done = h.reload(&run).await;
    assert_eq!(done.status, RunStatus::Expired);
    assert_eq!(done.money_state, MoneyState::Refunded);
    assert_eq!(done.actual_cost, Some(Money::parse("0.0100").unwrap()));
    assert_eq!(h.balance(tenant).await, "9.9900");
}

// S5: insufficient budget rejects the submit without any side effects.
#[tokio::test]
async fn insufficient_budget_mutates_nothing() {
    let h = Harness::new();
    let tenant = h.tenant_with_balance("0.0500").await;

    let err = h
        .submitter
        .submit(SubmitRequest {
            tenant_id: tenant,
            pack: decision_pack(),
            max_cost: Money::parse("1.0000").unwrap(),
            idempotency_key: Some("key-s5-00001".to_string()),
        })
        .await
        .unwrap_err();

    assert!(matches!(err, SubmitError::BudgetExceeded { .. }));
    assert_eq!(h.balance(tenant).await, "0.0500");
    assert_eq!(h.queue.depth(), 0);
    assert_eq!(h.budget.open_reservations(), 0);
    assert!(h
        .store
        .find_by_idempotency_key(tenant, "key-s5-00001")
        .await
        .unwrap()
        .is_none());
}

// S6: with the reservation still present, two finalizing actors racing end
// in exactly one settle and one terminal write.
#[tokio::test]
async fn double_settle_is_impossible() {
    let h = Harness::new();
    let tenant = h.tenant_with_balance("10.0000").await;

    for _ in 0..10 {
        let run = h.submit(tenant, "0.5000", None).await;
        let (leased, lease) = h.acquire_lease(&run).await;
        let leased = h.expire_lease(&leased).await;
        let result = h.upload_artifact(&leased, "0.4000").await;

        let before = h.budget.balance(tenant).await.unwrap();
        let worker = h.finalizer.finalize_success(&leased, lease, result);
        let reaper = h.finalizer.finalize_expired(&leased);
        let (w, r) = tokio::join!(worker, reaper);

        let winners = usize::from(w.unwrap().is_winner()) + usize::from(r.unwrap().is_winner());
        assert_eq!(winners, 1);

        // Exactly one settle moved money: the balance gained exactly one
        // refund of (reserved - charged).
        let done = h.reload(&run).await;
        let charged = done.actual_cost.unwrap();
        let refund = Money::parse("0.5000").unwrap().saturating_sub(charged);
        let after = h.budget.balance(tenant).await.unwrap();
        assert_eq!(after, before.checked_add(refund).unwrap());
        assert!(done.is_terminal());
    }
    assert_eq!(h.budget.open_reservations(), 0);
}

// Case A: claim stranded before settle, no artifact. The reconciler adopts
// the claim and refunds down to the minimum fee.
#[tokio::test]
async fn stranded_claim_without_artifact_is_refunded() {
    let h = Harness::new();
    let tenant = h.tenant_with_balance("10.0000").await;

    let run = h.submit(tenant, "1.0000", None).await;
    let (leased, _lease) = h.acquire_lease(&run).await;
    let (claimed, _token) = h.strand_claim(&leased, chrono::Duration::minutes(10)).await;

    let stats = h.reconciler.sweep_once().await;
    assert_eq!(stats.stuck_recovered, 1);

    let done = h.reload(&claimed).await;
    assert_eq!(done.status, RunStatus::Failed);
    assert_eq!(done.money_state, MoneyState::Refunded);
    assert_eq!(done.actual_cost, Some(run.minimum_fee));
    assert_eq!(
        done.last_error_reason_code.as_deref(),
        Some("FINALIZE_ABANDONED")
    );
    // Balance: only the minimum fee was kept.
    assert_eq!(h.balance(tenant).await, "9.9800");
}

// Case A with an uploaded artifact: the reconciler settles for the uploaded
// cost and completes the run.
#[tokio::test]
async fn stranded_claim_with_artifact_is_settled_as_success() {
    let h = Harness::new();
    let tenant = h.tenant_with_balance("10.0000").await;

    let run = h.submit(tenant, "1.5000", None).await;
    let (leased, _lease) = h.acquire_lease(&run).await;
    h.upload_artifact(&leased, "1.2000").await;
    let (claimed, _token) = h.strand_claim(&leased, chrono::Duration::minutes(10)).await;

    let stats = h.reconciler.sweep_once().await;
    assert_eq!(stats.stuck_recovered, 1);

    let done = h.reload(&claimed).await;
    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(done.money_state, MoneyState::Settled);
    assert_eq!(done.actual_cost, Some(Money::parse("1.2000").unwrap()));
    assert!(done.result_key.is_some());
    assert_eq!(h.balance(tenant).await, "8.8000");
}

// Case B past the reservation TTL: the amount is unverifiable, so the run
// terminates as AUDIT_REQUIRED and a human resolves it later.
#[tokio::test]
async fn stale_claim_past_reservation_ttl_requires_audit() {
    let h = Harness::new();
    let tenant = h.tenant_with_balance("10.0000").await;

    let run = h.submit(tenant, "1.0000", None).await;
    let (leased, _lease) = h.acquire_lease(&run).await;
    let (claimed, _token) = h.strand_claim(&leased, chrono::Duration::hours(2)).await;

    // Reservation gone (expired or settled, nobody can tell anymore).
    h.budget
        .settle(tenant, run.run_id, Money::parse("0.3000").unwrap())
        .await
        .unwrap();

    let stats = h.reconciler.sweep_once().await;
    assert_eq!(stats.audited, 1);

    let done = h.reload(&claimed).await;
    assert_eq!(done.money_state, MoneyState::AuditRequired);
    assert_eq!(done.finalize_stage, FinalizeStage::Committed);
    assert!(done.is_terminal());
    // No artifact survived, so the reservation ceiling is recorded as the
    // conservative charge pending review.
    assert_eq!(done.actual_cost, Some(Money::parse("1.0000").unwrap()));

    // Audit tooling confirms the charge and flips the state to SETTLED.
    assert!(resolve_audit(&h.store, &done, Money::parse("0.3000").unwrap())
        .await
        .unwrap());
    let resolved = h.reload(&done).await;
    assert_eq!(resolved.money_state, MoneyState::Settled);
    assert_eq!(resolved.actual_cost, Some(Money::parse("0.3000").unwrap()));
}

// Property 4: replaying the same idempotency key returns the same run and
// reserves exactly once.
#[tokio::test]
async fn idempotent_submit_replays_the_same_run() {
    let h = Harness::new();
    let tenant = h.tenant_with_balance("10.0000").await;

    let first = h.submit(tenant, "1.0000", Some("key-idem-0001")).await;
    let second = h.submit(tenant, "1.0000", Some("key-idem-0001")).await;

    assert_eq!(first.run_id, second.run_id);
    assert_eq!(h.budget.open_reservations(), 1);
    assert_eq!(h.balance(tenant).await, "9.0000");
    assert_eq!(h.queue.depth(), 1);
}

#[tokio::test]
async fn idempotency_key_with_different_payload_conflicts() {
    let h = Harness::new();
    let tenant = h.tenant_with_balance("10.0000").await;

    h.submit(tenant, "1.0000", Some("key-idem-0002")).await;
    let err = h
        .submitter
        .submit(SubmitRequest {
            tenant_id: tenant,
            pack: decision_pack(),
            max_cost: Money::parse("2.0000").unwrap(),
            idempotency_key: Some("key-idem-0002".to_string()),
        })
        .await
        .unwrap_err();

    assert!(matches!(err, SubmitError::IdempotencyConflict));
    // The original reservation is untouched.
    assert_eq!(h.balance(tenant).await, "9.0000");
    assert_eq!(h.budget.open_reservations(), 1);
}

// A queue outage after the reservation must refund and park the run.
#[tokio::test]
async fn enqueue_failure_refunds_and_fails_the_run() {
    #[derive(Debug)]
    struct BrokenQueue;

    #[async_trait::async_trait]
    impl DispatchQueue for BrokenQueue {
        async fn enqueue(
            &self,
            _message: packflow_infra::DispatchMessage,
        ) -> Result<String, QueueError> {
            Err(QueueError::Queue("broker unreachable".to_string()))
        }

        async fn receive(
            &self,
            _wait: Duration,
            _visibility_timeout: Duration,
        ) -> Result<Option<packflow_infra::QueuedMessage>, QueueError> {
            Ok(None)
        }

        async fn ack(&self, _receipt: &str) -> Result<(), QueueError> {
            Ok(())
        }
    }

    let timings = Timings::default();
    let store = Arc::new(InMemoryRunStore::new());
    let budget = Arc::new(InMemoryBudgetEngine::new(timings.t_res()));
    let submitter = Submitter::new(
        store.clone(),
        budget.clone(),
        Arc::new(BrokenQueue),
        timings,
        SubmitterConfig::default(),
    );

    let tenant = TenantId::new();
    budget
        .set_balance(tenant, Money::parse("5.0000").unwrap())
        .await
        .unwrap();

    let err = submitter
        .submit(SubmitRequest {
            tenant_id: tenant,
            pack: decision_pack(),
            max_cost: Money::parse("1.0000").unwrap(),
            idempotency_key: Some("key-broken-001".to_string()),
        })
        .await
        .unwrap_err();

    assert!(matches!(err, SubmitError::Queue(_)));
    assert_eq!(
        budget.balance(tenant).await.unwrap(),
        Money::parse("5.0000").unwrap()
    );
    assert_eq!(budget.open_reservations(), 0);

    let parked = store
        .find_by_idempotency_key(tenant, "key-broken-001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(parked.status, RunStatus::Failed);
    assert_eq!(parked.money_state, MoneyState::Refunded);
    assert_eq!(
        parked.last_error_reason_code.as_deref(),
        Some("QUEUE_ENQUEUE_FAILED")
    );
}

// Invariant 3: over a mixed batch of outcomes, money is conserved:
// initial - current = sum of charges on SETTLED and REFUNDED runs.
#[tokio::test]
async fn money_is_conserved_across_mixed_outcomes() {
    let h = Harness::new();
    let tenant = h.tenant_with_balance("100.0000").await;
    let initial = Money::parse("100.0000").unwrap();

    // Success.
    let a = h.submit(tenant, "2.0000", None).await;
    let (a_leased, a_lease) = h.acquire_lease(&a).await;
    let a_result = h.upload_artifact(&a_leased, "1.7500").await;
    assert!(h
        .finalizer
        .finalize_success(&a_leased, a_lease, a_result)
        .await
        .unwrap()
        .is_winner());

    // Worker-reported failure.
    let b = h.submit(tenant, "1.0000", None).await;
    let (b_leased, b_lease) = h.acquire_lease(&b).await;
    assert!(h
        .finalizer
        .finalize_failure(&b_leased, b_lease, "PACK_EXECUTION_FAILED", "executor blew up")
        .await
        .unwrap()
        .is_winner());

    // Lease expiry.
    let c = h.submit(tenant, "0.5000", None).await;
    let (c_leased, _) = h.acquire_lease(&c).await;
    h.expire_lease(&c_leased).await;
    assert_eq!(h.reconciler.sweep_once().await.expired_reaped, 1);

    // Still in flight: reservation open, counted separately.
    let d = h.submit(tenant, "3.0000", None).await;

    let mut charged = Money::ZERO;
    for run in [&a, &b, &c] {
        let done = h.reload(run).await;
        assert!(matches!(
            done.money_state,
            MoneyState::Settled | MoneyState::Refunded
        ));
        charged = charged.checked_add(done.actual_cost.unwrap()).unwrap();
    }

    let open = h.reload(&d).await.reservation_max_cost;
    let current = h.budget.balance(tenant).await.unwrap();
    assert_eq!(
        initial,
        current.checked_add(open).unwrap().checked_add(charged).unwrap()
    );
    assert_eq!(h.budget.open_reservations(), 1);
}

// Property 3: anything that reaches CLAIMED reaches COMMITTED within a
// bounded number of sweeps.
#[tokio::test]
async fn every_claim_eventually_commits() {
    let h = Harness::new();
    let tenant = h.tenant_with_balance("50.0000").await;

    // Strand claims in every recoverable shape.
    let with_artifact = h.submit(tenant, "1.0000", None).await;
    let (leased, _) = h.acquire_lease(&with_artifact).await;
    h.upload_artifact(&leased, "0.9000").await;
    h.strand_claim(&leased, chrono::Duration::minutes(10)).await;

    let without_artifact = h.submit(tenant, "1.0000", None).await;
    let (leased, _) = h.acquire_lease(&without_artifact).await;
    h.strand_claim(&leased, chrono::Duration::minutes(10)).await;

    let settled_unlogged = h.submit(tenant, "1.0000", None).await;
    let (leased, _) = h.acquire_lease(&settled_unlogged).await;
    h.strand_claim(&leased, chrono::Duration::minutes(10)).await;
    h.budget
        .settle(tenant, settled_unlogged.run_id, Money::parse("0.5000").unwrap())
        .await
        .unwrap();

    h.reconciler.sweep_once().await;

    for run in [&with_artifact, &without_artifact, &settled_unlogged] {
        let done = h.reload(run).await;
        assert_eq!(done.finalize_stage, FinalizeStage::Committed, "{}", run.run_id);
        assert!(done.is_terminal());
    }
    assert_eq!(h.budget.open_reservations(), 0);
}
