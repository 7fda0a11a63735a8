//! Cross-component scenarios from spec.md §8 (S1-S6). Each test drives the
//! real in-memory store/ledger implementations through the Submission Path,
//! Finalize Protocol, and Reconciler exactly as a Worker/Reconciler pair
//! would, asserting the externally observable money and status outcomes.

use chrono::{Duration, Utc};
use runpack_core::budget::memory as memory_budget;
use runpack_core::finalize::{self, AbortReason, FinalizeResult};
use runpack_core::object_store::memory as memory_object_store;
use runpack_core::ObjectStore;
use runpack_core::queue::memory as memory_dispatcher;
use runpack_core::reconciler::{sweep_expired_leases, sweep_stuck_claimed};
use runpack_core::run_store::memory as memory_run_store;
use runpack_core::submission::{submit, SubmissionRequest};
use runpack_core::{BudgetEngine, BudgetError};
use runpack_core::{Money, MoneyState, RunStatus, RunStore, Ttls};

fn money(value: &str) -> Money {
    Money::parse_fixed4(value).expect("valid money literal")
}

fn ttls() -> Ttls {
    Ttls {
        t_res: Duration::hours(1),
        t_stuck: Duration::minutes(5),
        lease_ttl: Duration::minutes(6),
        sweep_period: Duration::seconds(60),
    }
}

#[tokio::test]
async fn s1_happy_path() {
    let run_store = memory_run_store();
    let budget = memory_budget(ttls().t_res);
    let object_store = memory_object_store();
    let dispatcher = memory_dispatcher();
    budget.credit("tenant-1", money("10.0000")).await;

    let run = submit(
        run_store.as_ref(),
        &budget,
        &dispatcher,
        SubmissionRequest {
            tenant_id: "tenant-1".to_string(),
            pack_spec: serde_json::json!({"kind": "fetch_url"}),
            max_cost: money("1.5000"),
            minimum_fee: money("0.0100"),
            soft_limit: Money::ZERO,
            idempotency_key: None,
            lease_ttl_seconds: 360,
        },
    )
    .await
    .unwrap();

    let result = finalize::finalize_success(
        run_store.as_ref(),
        &budget,
        &object_store,
        &run,
        "worker-token",
        b"result bytes",
        "deadbeef",
        money("1.0000"),
    )
    .await
    .unwrap();

    let committed = match result {
        FinalizeResult::Committed(run) => run,
        FinalizeResult::Aborted(reason) => panic!("unexpected abort: {reason:?}"),
    };
    assert_eq!(committed.status, RunStatus::Completed);
    assert_eq!(committed.money_state, MoneyState::Settled);
    assert_eq!(committed.actual_cost, Some(money("1.0000")));
    assert_eq!(budget.balance("tenant-1").await, money("9.0000"));
}

#[tokio::test]
async fn s2_worker_and_reconciler_race_on_claim() {
    let run_store = memory_run_store();
    let budget = memory_budget(ttls().t_res);
    let object_store = memory_object_store();
    budget.credit("tenant-1", money("10.0000")).await;

    let mut run = runpack_core::Run::new(
        "run-1".to_string(),
        "tenant-1".to_string(),
        serde_json::json!({"kind": "fetch_url"}),
        money("1.5000"),
        money("0.0100"),
        None,
        Utc::now(),
    );
    run.status = RunStatus::Processing;
    budget
        .reserve("tenant-1", "run-1", run.reservation_max_cost, Money::ZERO)
        .await
        .unwrap();
    let run = run_store.create(run).await.unwrap();

    let worker_attempt = finalize::finalize_success(
        run_store.as_ref(),
        &budget,
        &object_store,
        &run,
        "worker-token",
        b"payload",
        "deadbeef",
        money("1.0000"),
    );
    let reconciler_attempt = finalize::finalize_failure(
        run_store.as_ref(),
        &budget,
        &run,
        "reconciler-token",
        RunStatus::Expired,
        money("0.0100"),
        "LEASE_EXPIRED",
    );

    let (worker_result, reconciler_result) = tokio::join!(worker_attempt, reconciler_attempt);
    let worker_result = worker_result.unwrap();
    let reconciler_result = reconciler_result.unwrap();

    let committed_count = [&worker_result, &reconciler_result]
        .iter()
        .filter(|result| matches!(result, FinalizeResult::Committed(_)))
        .count();
    assert_eq!(committed_count, 1, "exactly one actor must commit");

    let aborted = [&worker_result, &reconciler_result]
        .into_iter()
        .find(|result| matches!(result, FinalizeResult::Aborted(_)))
        .expect("the loser must abort");
    assert!(matches!(
        aborted,
        FinalizeResult::Aborted(AbortReason::ClaimLost)
    ));
}

#[tokio::test]
async fn s3_crash_after_settle_before_commit_recovers_idempotently() {
    let run_store = memory_run_store();
    let budget = memory_budget(ttls().t_res);
    let object_store = memory_object_store();
    budget.credit("tenant-1", money("10.0000")).await;

    let mut run = runpack_core::Run::new(
        "run-1".to_string(),
        "tenant-1".to_string(),
        serde_json::json!({"kind": "fetch_url"}),
        money("1.5000"),
        money("0.0100"),
        None,
        Utc::now(),
    );
    run.status = RunStatus::Processing;
    run.finalize_stage = runpack_core::FinalizeStage::Claimed;
    run.finalize_token = Some("dead-worker".to_string());
    run.finalize_claimed_at = Some(Utc::now() - Duration::minutes(10));
    run_store.create(run).await.unwrap();

    // Simulate: worker already settled on the ledger (balance credited with
    // refund) and uploaded the artifact, but crashed before committing the
    // terminal Run Store write. The reservation is gone; only the artifact
    // metadata remains as evidence.
    object_store
        .upload("run-1", b"result", money("1.0000"), "deadbeef")
        .await
        .unwrap();

    let summary = sweep_stuck_claimed(
        run_store.as_ref(),
        &budget,
        &object_store,
        &ttls(),
        Utc::now(),
    )
    .await
    .unwrap();
    assert_eq!(summary.stuck_force_settled, 1);
    assert_eq!(summary.audit_required, 0);

    let stored = run_store.load("run-1").await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Completed);
    assert_eq!(stored.money_state, MoneyState::Settled);
    assert_eq!(stored.actual_cost, Some(money("1.0000")));
    // Balance conservation: no reservation was ever created against this
    // tenant in this scenario (it was consumed before the crash point we're
    // simulating), so the starting balance is untouched by the recovery.
    assert_eq!(budget.balance("tenant-1").await, money("10.0000"));
}

#[tokio::test]
async fn s4_lease_expiry_refunds_minimum_fee() {
    let run_store = memory_run_store();
    let budget = memory_budget(ttls().t_res);
    budget.credit("tenant-1", money("10.0000")).await;

    let mut run = runpack_core::Run::new(
        "run-1".to_string(),
        "tenant-1".to_string(),
        serde_json::json!({"kind": "fetch_url"}),
        money("1.5000"),
        money("0.0100"),
        None,
        Utc::now(),
    );
    run.status = RunStatus::Processing;
    run.lease_expires_at = Some(Utc::now() - Duration::seconds(5));
    budget
        .reserve("tenant-1", "run-1", run.reservation_max_cost, Money::ZERO)
        .await
        .unwrap();
    run_store.create(run).await.unwrap();

    let summary = sweep_expired_leases(run_store.as_ref(), &budget, money("0.0100"), Utc::now())
        .await
        .unwrap();
    assert_eq!(summary.expired_leases_finalized, 1);

    let stored = run_store.load("run-1").await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Expired);
    assert_eq!(stored.money_state, MoneyState::Refunded);
    assert_eq!(budget.balance("tenant-1").await, money("9.9900"));
}

#[tokio::test]
async fn s5_insufficient_budget_rejects_without_side_effects() {
    let run_store = memory_run_store();
    let budget = memory_budget(ttls().t_res);
    let dispatcher = memory_dispatcher();
    budget.credit("tenant-1", money("0.0500")).await;

    let err = submit(
        run_store.as_ref(),
        &budget,
        &dispatcher,
        SubmissionRequest {
            tenant_id: "tenant-1".to_string(),
            pack_spec: serde_json::json!({"kind": "fetch_url"}),
            max_cost: money("1.0000"),
            minimum_fee: money("0.0100"),
            soft_limit: Money::ZERO,
            idempotency_key: None,
            lease_ttl_seconds: 360,
        },
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        runpack_core::SubmissionError::BudgetExceeded
    ));
    assert_eq!(budget.balance("tenant-1").await, money("0.0500"));
    assert!(dispatcher.take_all().await.is_empty());
    assert!(budget
        .get_reservation("tenant-1", "nonexistent")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn s6_double_settle_prevention() {
    let run_store = memory_run_store();
    let budget = memory_budget(ttls().t_res);
    let object_store = memory_object_store();
    budget.credit("tenant-1", money("10.0000")).await;

    let mut run = runpack_core::Run::new(
        "run-1".to_string(),
        "tenant-1".to_string(),
        serde_json::json!({"kind": "fetch_url"}),
        money("1.5000"),
        money("0.0100"),
        None,
        Utc::now(),
    );
    run.status = RunStatus::Processing;
    budget
        .reserve("tenant-1", "run-1", run.reservation_max_cost, Money::ZERO)
        .await
        .unwrap();
    let run = run_store.create(run).await.unwrap();

    let worker = finalize::finalize_success(
        run_store.as_ref(),
        &budget,
        &object_store,
        &run,
        "worker-token",
        b"payload",
        "deadbeef",
        money("1.0000"),
    )
    .await
    .unwrap();
    assert!(matches!(worker, FinalizeResult::Committed(_)));

    // The reservation no longer exists; a direct settle attempt (standing
    // in for the Reconciler's finalize invocation racing in) must observe
    // ERR_NO_RESERVE rather than silently re-crediting the tenant.
    let second_settle = budget.settle("tenant-1", "run-1", money("1.0000")).await;
    assert!(matches!(second_settle, Err(BudgetError::NoReserve)));
}
