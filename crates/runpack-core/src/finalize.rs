use chrono::Utc;

use crate::budget::{BudgetEngine, BudgetError};
use crate::money::Money;
use crate::object_store::{ObjectStore, ObjectStoreError};
use crate::run::{FinalizeStage, MoneyState, Run, RunExtraConditions, RunFieldUpdates, RunStatus};
use crate::run_store::{RunStore, RunStoreError};

#[derive(Debug, thiserror::Error)]
pub enum FinalizeError {
    #[error("run store error: {0}")]
    RunStore(#[from] RunStoreError),
    #[error("budget engine error: {0}")]
    Budget(#[from] BudgetError),
    #[error("object store error: {0}")]
    ObjectStore(#[from] ObjectStoreError),
}

/// Why a finalize attempt stopped without writing a terminal state. Every
/// variant here is an EXPECTED outcome of the concurrency model (spec.md
/// §7, "Race" kind) — callers must not retry or surface these to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Phase 1 claim lost: another actor holds `finalize_stage = CLAIMED`.
    ClaimLost,
    /// Phase 2a settle/refund returned `ERR_NO_RESERVE`: another actor
    /// already settled this run.
    NoReserve,
    /// Phase 2b commit CAS was rejected after this actor held the claim.
    /// Should not happen absent clock skew or a Reconciler override.
    CommitLost,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeResult {
    Committed(Run),
    Aborted(AbortReason),
}

/// Phase 1: attempt to move `UNCLAIMED -> CLAIMED` under `my_token`.
/// Returns `None` when another actor already owns the claim.
async fn claim(
    run_store: &dyn RunStore,
    run: &Run,
    my_token: &str,
) -> Result<Option<Run>, RunStoreError> {
    run_store
        .cas_update(
            &run.run_id,
            run.version,
            RunFieldUpdates {
                finalize_stage: Some(FinalizeStage::Claimed),
                finalize_token: Some(Some(my_token.to_string())),
                finalize_claimed_at: Some(Some(Utc::now())),
                ..Default::default()
            },
            RunExtraConditions {
                finalize_stage: Some(FinalizeStage::Unclaimed),
                ..Default::default()
            },
        )
        .await
}

/// Phase 2b: commit a terminal state for a run this actor holds the claim
/// on. Scoped to `{finalize_stage: CLAIMED, finalize_token: my_token}` so a
/// stale actor can never overwrite a Reconciler's recovery commit.
#[allow(clippy::too_many_arguments)]
async fn commit(
    run_store: &dyn RunStore,
    claimed: &Run,
    my_token: &str,
    terminal_status: RunStatus,
    money_state: MoneyState,
    actual_cost: Money,
    result_key: Option<String>,
    result_hash: Option<String>,
    reason_code: Option<String>,
) -> Result<Option<Run>, RunStoreError> {
    run_store
        .cas_update(
            &claimed.run_id,
            claimed.version,
            RunFieldUpdates {
                status: Some(terminal_status),
                money_state: Some(money_state),
                finalize_stage: Some(FinalizeStage::Committed),
                actual_cost: Some(Some(actual_cost)),
                result_key: Some(result_key),
                result_hash: Some(result_hash),
                last_error_reason_code: Some(reason_code),
                ..Default::default()
            },
            RunExtraConditions {
                finalize_stage: Some(FinalizeStage::Claimed),
                finalize_token: Some(my_token.to_string()),
                ..Default::default()
            },
        )
        .await
}

fn log_commit_lost(run_id: &str) {
    tracing::warn!(run_id, "finalize commit lost after claim; leaving to reconciler");
}

/// Drives one run from `PROCESSING` (well, from wherever it currently sits
/// with `finalize_stage = UNCLAIMED`) to `COMPLETED/SETTLED` via the
/// two-phase protocol (spec.md §4.3). `actual_cost` and the artifact bytes
/// come from the caller (Worker) having already executed the pack.
#[allow(clippy::too_many_arguments)]
pub async fn finalize_success(
    run_store: &dyn RunStore,
    budget: &dyn BudgetEngine,
    object_store: &dyn ObjectStore,
    run: &Run,
    my_token: &str,
    payload: &[u8],
    content_hash: &str,
    actual_cost: Money,
) -> Result<FinalizeResult, FinalizeError> {
    let Some(claimed) = claim(run_store, run, my_token).await? else {
        tracing::debug!(run_id = %run.run_id, "finalize claim lost");
        return Ok(FinalizeResult::Aborted(AbortReason::ClaimLost));
    };
    tracing::info!(run_id = %claimed.run_id, tenant_id = %claimed.tenant_id, version = claimed.version, finalize_stage = claimed.finalize_stage.as_str(), "finalize claimed");

    let artifact = object_store
        .upload(&claimed.run_id, payload, actual_cost, content_hash)
        .await?;

    let settled = match budget.settle(&claimed.tenant_id, &claimed.run_id, actual_cost).await {
        Ok(outcome) => outcome,
        Err(BudgetError::NoReserve) => {
            tracing::debug!(run_id = %claimed.run_id, "settle lost the race: no reservation");
            return Ok(FinalizeResult::Aborted(AbortReason::NoReserve));
        }
        Err(other) => return Err(FinalizeError::Budget(other)),
    };

    let committed = commit(
        run_store,
        &claimed,
        my_token,
        RunStatus::Completed,
        MoneyState::Settled,
        settled.charge,
        Some(artifact.result_key),
        Some(artifact.result_hash),
        None,
    )
    .await?;

    match committed {
        Some(run) => {
            tracing::info!(run_id = %run.run_id, tenant_id = %run.tenant_id, version = run.version, finalize_stage = run.finalize_stage.as_str(), "finalize committed");
            Ok(FinalizeResult::Committed(run))
        }
        None => {
            log_commit_lost(&claimed.run_id);
            Ok(FinalizeResult::Aborted(AbortReason::CommitLost))
        }
    }
}

/// Failure/timeout path: no upload, refund the minimum fee, terminal state
/// is `FAILED` or `EXPIRED` (spec.md §4.3, §4.4 Sweep 1).
pub async fn finalize_failure(
    run_store: &dyn RunStore,
    budget: &dyn BudgetEngine,
    run: &Run,
    my_token: &str,
    terminal_status: RunStatus,
    minimum_fee: Money,
    reason_code: &str,
) -> Result<FinalizeResult, FinalizeError> {
    let Some(claimed) = claim(run_store, run, my_token).await? else {
        tracing::debug!(run_id = %run.run_id, "finalize claim lost");
        return Ok(FinalizeResult::Aborted(AbortReason::ClaimLost));
    };
    tracing::info!(run_id = %claimed.run_id, tenant_id = %claimed.tenant_id, version = claimed.version, finalize_stage = claimed.finalize_stage.as_str(), "finalize claimed (failure path)");

    let refunded = match budget
        .refund(&claimed.tenant_id, &claimed.run_id, minimum_fee)
        .await
    {
        Ok(outcome) => outcome,
        Err(BudgetError::NoReserve) => {
            tracing::debug!(run_id = %claimed.run_id, "refund lost the race: no reservation");
            return Ok(FinalizeResult::Aborted(AbortReason::NoReserve));
        }
        Err(other) => return Err(FinalizeError::Budget(other)),
    };

    let committed = commit(
        run_store,
        &claimed,
        my_token,
        terminal_status,
        MoneyState::Refunded,
        refunded.charge,
        None,
        None,
        Some(reason_code.to_string()),
    )
    .await?;

    match committed {
        Some(run) => {
            tracing::info!(run_id = %run.run_id, tenant_id = %run.tenant_id, version = run.version, finalize_stage = run.finalize_stage.as_str(), "finalize committed (failure path)");
            Ok(FinalizeResult::Committed(run))
        }
        None => {
            log_commit_lost(&claimed.run_id);
            Ok(FinalizeResult::Aborted(AbortReason::CommitLost))
        }
    }
}

/// Re-claims a run already in `CLAIMED` whose claim is stuck (spec.md §4.4
/// Sweep 2 Case A). Used by the Reconciler to adopt a stalled actor's
/// token lineage via a scoped `extra_conditions` re-claim rather than the
/// plain `UNCLAIMED -> CLAIMED` transition `claim` performs.
pub async fn reclaim_stuck(
    run_store: &dyn RunStore,
    run: &Run,
    my_token: &str,
    claimed_before: chrono::DateTime<Utc>,
) -> Result<Option<Run>, RunStoreError> {
    run_store
        .cas_update(
            &run.run_id,
            run.version,
            RunFieldUpdates {
                finalize_token: Some(Some(my_token.to_string())),
                finalize_claimed_at: Some(Some(Utc::now())),
                ..Default::default()
            },
            RunExtraConditions {
                finalize_stage: Some(FinalizeStage::Claimed),
                finalize_claimed_before: Some(claimed_before),
                ..Default::default()
            },
        )
        .await
}
