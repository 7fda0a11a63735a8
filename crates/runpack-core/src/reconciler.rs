use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::budget::{BudgetEngine, BudgetError};
use crate::config::Ttls;
use crate::finalize::{self, AbortReason, FinalizeResult};
use crate::money::Money;
use crate::object_store::ObjectStore;
use crate::run::{FinalizeStage, MoneyState, Run, RunExtraConditions, RunFieldUpdates, RunStatus};
use crate::run_store::{RunStore, RunStoreError};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("run store error: {0}")]
    RunStore(#[from] RunStoreError),
    #[error("budget engine error: {0}")]
    Budget(#[from] BudgetError),
}

/// Outcome of one reconciliation pass, mirroring the teacher's
/// `ComputeTreasuryReconcileSummary` shape — counts first, details after.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub schema: String,
    pub reconciled_at: Option<DateTime<Utc>>,
    pub expired_leases_finalized: u64,
    pub stuck_claims_adopted: u64,
    pub stuck_force_settled: u64,
    pub audit_required: u64,
    pub races_lost: u64,
}

impl ReconcileSummary {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            schema: "runpack.reconciler.summary.v1".to_string(),
            reconciled_at: Some(now),
            ..Default::default()
        }
    }
}

/// Sweep 1 (spec.md §4.4): `PROCESSING` runs whose lease has expired are
/// driven through the ordinary failure-path Finalize Protocol as the
/// Reaper actor.
pub async fn sweep_expired_leases(
    run_store: &dyn RunStore,
    budget: &dyn BudgetEngine,
    minimum_fee: Money,
    now: DateTime<Utc>,
) -> Result<ReconcileSummary, ReconcileError> {
    let mut summary = ReconcileSummary::new(now);
    let expired = run_store.scan_expired_leases(now).await?;
    for run in expired {
        let my_token = format!("reconciler-reaper-{}", uuid::Uuid::new_v4());
        let result = finalize::finalize_failure(
            run_store,
            budget,
            &run,
            &my_token,
            RunStatus::Expired,
            minimum_fee,
            "LEASE_EXPIRED",
        )
        .await?;
        match result {
            FinalizeResult::Committed(_) => summary.expired_leases_finalized += 1,
            FinalizeResult::Aborted(AbortReason::ClaimLost | AbortReason::NoReserve) => {
                summary.races_lost += 1;
            }
            FinalizeResult::Aborted(AbortReason::CommitLost) => {}
        }
    }
    Ok(summary)
}

/// Sweep 2 (spec.md §4.4): runs stuck in `CLAIMED` past `ttls.t_stuck`.
/// Dispatches to Case A (reservation still present, resume the ordinary
/// protocol) or Case B (reservation already consumed, idempotent
/// force-settle) depending on what the Budget Engine reports.
pub async fn sweep_stuck_claimed(
    run_store: &dyn RunStore,
    budget: &dyn BudgetEngine,
    object_store: &dyn ObjectStore,
    ttls: &Ttls,
    now: DateTime<Utc>,
) -> Result<ReconcileSummary, ReconcileError> {
    let mut summary = ReconcileSummary::new(now);
    let stuck = run_store.scan_stuck_claimed(ttls.t_stuck).await?;

    for run in stuck {
        let Some(claimed_at) = run.finalize_claimed_at else {
            continue;
        };
        let reservation = budget.get_reservation(&run.tenant_id, &run.run_id).await?;

        if reservation.is_some() {
            handle_case_a(
                run_store,
                budget,
                object_store,
                &run,
                claimed_at,
                ttls.t_stuck,
                &mut summary,
            )
            .await?;
        } else {
            handle_case_b(run_store, object_store, &run, claimed_at, ttls.t_res, &mut summary)
                .await?;
        }
    }
    Ok(summary)
}

async fn handle_case_a(
    run_store: &dyn RunStore,
    budget: &dyn BudgetEngine,
    object_store: &dyn ObjectStore,
    run: &Run,
    claimed_at: DateTime<Utc>,
    t_stuck: Duration,
    summary: &mut ReconcileSummary,
) -> Result<(), ReconcileError> {
    let my_token = format!("reconciler-stuck-{}", uuid::Uuid::new_v4());
    let Some(adopted) =
        finalize::reclaim_stuck(run_store, run, &my_token, claimed_at + t_stuck).await?
    else {
        summary.races_lost += 1;
        return Ok(());
    };
    summary.stuck_claims_adopted += 1;

    // The artifact's presence distinguishes a crash before vs. after the
    // worker finished the job; fall back to the failure path when unknown.
    let artifact = object_store.get_metadata(&adopted.run_id).await.ok().flatten();
    let settle_result = match &artifact {
        Some(artifact) => {
            budget
                .settle(&adopted.tenant_id, &adopted.run_id, artifact.actual_cost)
                .await
        }
        None => {
            budget
                .refund(&adopted.tenant_id, &adopted.run_id, adopted.minimum_fee)
                .await
        }
    };
    let (terminal_status, money_state, result_key, result_hash) = match &artifact {
        Some(artifact) => (
            RunStatus::Completed,
            MoneyState::Settled,
            Some(artifact.result_key.clone()),
            Some(artifact.result_hash.clone()),
        ),
        None => (RunStatus::Failed, MoneyState::Refunded, None, None),
    };

    match settle_result {
        Ok(outcome) => {
            let committed = run_store
                .cas_update(
                    &adopted.run_id,
                    adopted.version,
                    RunFieldUpdates {
                        status: Some(terminal_status),
                        money_state: Some(money_state),
                        finalize_stage: Some(FinalizeStage::Committed),
                        actual_cost: Some(Some(outcome.charge)),
                        result_key: Some(result_key),
                        result_hash: Some(result_hash),
                        last_error_reason_code: Some(Some("RECONCILER_STUCK_CLAIM".to_string())),
                        ..Default::default()
                    },
                    RunExtraConditions {
                        finalize_stage: Some(FinalizeStage::Claimed),
                        finalize_token: Some(my_token),
                        ..Default::default()
                    },
                )
                .await?;
            if committed.is_some() {
                summary.stuck_force_settled += 1;
            }
        }
        Err(BudgetError::NoReserve) => {
            summary.races_lost += 1;
        }
        Err(other) => return Err(ReconcileError::Budget(other)),
    }
    Ok(())
}

/// Case B: the prior actor's settle already landed on the ledger but the
/// terminal write to the Run Store never happened. Idempotent by
/// construction — `extra_conditions` requires `money_state = RESERVED`, so
/// a run this sweep already advanced will simply fail the CAS on a later
/// pass rather than being rewritten.
async fn handle_case_b(
    run_store: &dyn RunStore,
    object_store: &dyn ObjectStore,
    run: &Run,
    claimed_at: DateTime<Utc>,
    t_res: Duration,
    summary: &mut ReconcileSummary,
) -> Result<(), ReconcileError> {
    let age = Utc::now() - claimed_at;
    let within_ttl = age < t_res;

    let metadata = object_store.get_metadata(&run.run_id).await.ok().flatten();
    let (terminal_status, actual_cost, result_key, result_hash) = match &metadata {
        Some(artifact) => (
            RunStatus::Completed,
            artifact.actual_cost,
            Some(artifact.result_key.clone()),
            Some(artifact.result_hash.clone()),
        ),
        None => (RunStatus::Failed, run.reservation_max_cost, None, None),
    };

    let money_state = if within_ttl {
        MoneyState::Settled
    } else {
        MoneyState::AuditRequired
    };
    if !within_ttl {
        summary.audit_required += 1;
    }

    let committed = run_store
        .cas_update(
            &run.run_id,
            run.version,
            RunFieldUpdates {
                status: Some(terminal_status),
                money_state: Some(money_state),
                finalize_stage: Some(FinalizeStage::Committed),
                actual_cost: Some(Some(actual_cost)),
                result_key: Some(result_key),
                result_hash: Some(result_hash),
                last_error_reason_code: Some(Some("RECONCILER_FORCE_SETTLE".to_string())),
                ..Default::default()
            },
            RunExtraConditions {
                finalize_stage: Some(FinalizeStage::Claimed),
                money_state: Some(MoneyState::Reserved),
                ..Default::default()
            },
        )
        .await?;

    if committed.is_some() {
        summary.stuck_force_settled += 1;
    } else {
        summary.races_lost += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::memory as memory_budget;
    use crate::object_store::memory as memory_object_store;
    use crate::run_store::memory as memory_run_store;

    fn ttls() -> Ttls {
        Ttls {
            t_res: Duration::hours(1),
            t_stuck: Duration::minutes(5),
            lease_ttl: Duration::seconds(90),
            sweep_period: Duration::seconds(60),
        }
    }

    fn sample_run(run_id: &str, tenant_id: &str) -> Run {
        Run::new(
            run_id.to_string(),
            tenant_id.to_string(),
            serde_json::json!({"kind": "fetch_url"}),
            Money::parse_fixed4("1.5000").unwrap(),
            Money::parse_fixed4("0.0100").unwrap(),
            None,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn sweep_expired_leases_refunds_and_marks_expired() {
        let run_store = memory_run_store();
        let budget = memory_budget(Duration::hours(1));
        budget
            .credit("tenant-1", Money::parse_fixed4("10.0000").unwrap())
            .await;

        let mut run = sample_run("run-1", "tenant-1");
        run.status = RunStatus::Processing;
        run.lease_expires_at = Some(Utc::now() - Duration::seconds(5));
        budget
            .reserve("tenant-1", "run-1", run.reservation_max_cost, Money::ZERO)
            .await
            .unwrap();
        run_store.create(run).await.unwrap();

        let summary = sweep_expired_leases(
            run_store.as_ref(),
            &budget,
            Money::parse_fixed4("0.0100").unwrap(),
            Utc::now(),
        )
        .await
        .unwrap();
        assert_eq!(summary.expired_leases_finalized, 1);

        let stored = run_store.load("run-1").await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Expired);
        assert_eq!(stored.money_state, MoneyState::Refunded);
    }

    #[tokio::test]
    async fn sweep_stuck_claimed_case_b_force_settles_idempotently() {
        let run_store = memory_run_store();
        let budget = memory_budget(Duration::hours(1));
        let object_store = memory_object_store();
        budget
            .credit("tenant-1", Money::parse_fixed4("10.0000").unwrap())
            .await;

        let mut run = sample_run("run-1", "tenant-1");
        run.status = RunStatus::Processing;
        run.finalize_stage = FinalizeStage::Claimed;
        run.finalize_token = Some("dead-worker".to_string());
        run.finalize_claimed_at = Some(Utc::now() - Duration::minutes(10));
        run_store.create(run).await.unwrap();

        object_store
            .upload(
                "run-1",
                b"result",
                Money::parse_fixed4("1.0000").unwrap(),
                "deadbeef",
            )
            .await
            .unwrap();

        let ttls = ttls();
        let first = sweep_stuck_claimed(run_store.as_ref(), &budget, &object_store, &ttls, Utc::now())
            .await
            .unwrap();
        assert_eq!(first.stuck_force_settled, 1);

        let stored = run_store.load("run-1").await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(stored.money_state, MoneyState::Settled);

        let second =
            sweep_stuck_claimed(run_store.as_ref(), &budget, &object_store, &ttls, Utc::now())
                .await
                .unwrap();
        assert_eq!(second.stuck_force_settled, 0);
    }

    #[tokio::test]
    async fn sweep_stuck_claimed_case_b_marks_audit_required_past_ttl() {
        let run_store = memory_run_store();
        let budget = memory_budget(Duration::hours(1));
        let object_store = memory_object_store();

        let mut run = sample_run("run-1", "tenant-1");
        run.status = RunStatus::Processing;
        run.finalize_stage = FinalizeStage::Claimed;
        run.finalize_token = Some("dead-worker".to_string());
        run.finalize_claimed_at = Some(Utc::now() - Duration::hours(2));
        run_store.create(run).await.unwrap();

        let mut ttls = ttls();
        ttls.t_res = Duration::minutes(30);
        let summary =
            sweep_stuck_claimed(run_store.as_ref(), &budget, &object_store, &ttls, Utc::now())
                .await
                .unwrap();
        assert_eq!(summary.audit_required, 1);

        let stored = run_store.load("run-1").await.unwrap().unwrap();
        assert_eq!(stored.money_state, MoneyState::AuditRequired);
    }
}
