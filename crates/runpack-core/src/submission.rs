use chrono::Utc;
use serde_json::Value;

use crate::budget::{BudgetEngine, BudgetError};
use crate::money::Money;
use crate::queue::{DispatchMessage, Dispatcher, DispatcherError};
use crate::run::Run;
use crate::run_store::{RunStore, RunStoreError};

#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error("budget exceeded")]
    BudgetExceeded,
    #[error("idempotency_key reused with different reservation parameters")]
    IdempotencyConflict,
    #[error("run store error: {0}")]
    RunStore(#[from] RunStoreError),
    #[error("budget engine error: {0}")]
    Budget(#[from] BudgetError),
    #[error("dispatcher error: {0}")]
    Dispatcher(#[from] DispatcherError),
}

impl SubmissionError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::BudgetExceeded => "BUDGET_EXCEEDED",
            Self::IdempotencyConflict => "IDEMPOTENCY_CONFLICT",
            Self::RunStore(_) => "RUN_STORE_ERROR",
            Self::Budget(_) => "BUDGET_ENGINE_ERROR",
            Self::Dispatcher(_) => "DISPATCH_ERROR",
        }
    }
}

pub struct SubmissionRequest {
    pub tenant_id: String,
    pub pack_spec: Value,
    pub max_cost: Money,
    pub minimum_fee: Money,
    /// Threshold the reservation may drive the tenant's balance down to
    /// (spec.md §3, Tenant.soft_limit_threshold). Negative or zero; see
    /// `BudgetEngine::reserve`'s `balance - amount >= soft_limit` check.
    pub soft_limit: Money,
    pub idempotency_key: Option<String>,
    pub lease_ttl_seconds: i64,
}

/// Submission Path (spec.md §4.5). `reserve` happens before `create`, so a
/// failure after reservation must be explicitly compensated — never leave
/// money locked against a run nobody will ever finalize.
pub async fn submit(
    run_store: &dyn RunStore,
    budget: &dyn BudgetEngine,
    dispatcher: &dyn Dispatcher,
    request: SubmissionRequest,
) -> Result<Run, SubmissionError> {
    if let Some(idempotency_key) = &request.idempotency_key {
        if let Some(existing) = run_store
            .find_by_idempotency_key(&request.tenant_id, idempotency_key)
            .await?
        {
            return Ok(existing);
        }
    }

    let run_id = uuid::Uuid::new_v4().to_string();

    budget
        .reserve(
            &request.tenant_id,
            &run_id,
            request.max_cost,
            request.soft_limit,
        )
        .await
        .map_err(|err| match err {
            BudgetError::Insufficient => SubmissionError::BudgetExceeded,
            BudgetError::Duplicate => SubmissionError::IdempotencyConflict,
            other => SubmissionError::Budget(other),
        })?;

    match create_and_dispatch(run_store, dispatcher, &request, &run_id).await {
        Ok(run) => Ok(run),
        Err(err) => {
            // Compensating action: undo the reservation for a run that will
            // never become visible (spec.md §4.5 step 5). `settle(0)` is the
            // full-refund form of `refund`.
            if let Err(refund_err) = budget.refund(&request.tenant_id, &run_id, Money::ZERO).await
            {
                tracing::error!(
                    run_id = %run_id,
                    tenant_id = %request.tenant_id,
                    error = %refund_err,
                    "compensating refund failed after submission error"
                );
            }
            Err(err)
        }
    }
}

async fn create_and_dispatch(
    run_store: &dyn RunStore,
    dispatcher: &dyn Dispatcher,
    request: &SubmissionRequest,
    run_id: &str,
) -> Result<Run, SubmissionError> {
    let run = Run::new(
        run_id.to_string(),
        request.tenant_id.clone(),
        request.pack_spec.clone(),
        request.max_cost,
        request.minimum_fee,
        request.idempotency_key.clone(),
        Utc::now(),
    );
    let created = run_store.create(run).await?;

    dispatcher
        .enqueue(DispatchMessage {
            run_id: created.run_id.clone(),
            tenant_id: created.tenant_id.clone(),
            pack_spec: created.pack_spec.clone(),
            lease_ttl_seconds: request.lease_ttl_seconds,
        })
        .await?;

    Ok(created)
}
