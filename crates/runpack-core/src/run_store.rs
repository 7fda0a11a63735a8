use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::run::{FinalizeStage, Run, RunExtraConditions, RunFieldUpdates, RunStatus};

#[derive(Debug, thiserror::Error)]
pub enum RunStoreError {
    #[error("run already exists: {0}")]
    AlreadyExists(String),
    #[error("run not found: {0}")]
    NotFound(String),
    #[error("idempotency key reused with different parameters for tenant {0}")]
    IdempotencyConflict(String),
    #[error("store error: {0}")]
    Store(String),
}

/// Durable, linearizable storage of [`Run`] records with compare-and-set
/// updates. `cas_update` is the ONLY mutation primitive after `create` — see
/// spec.md §4.1.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create(&self, run: Run) -> Result<Run, RunStoreError>;

    async fn load(&self, run_id: &str) -> Result<Option<Run>, RunStoreError>;

    async fn find_by_idempotency_key(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<Run>, RunStoreError>;

    /// Atomically applies `updates` iff the stored `version == expected_version`
    /// and every predicate in `extra_conditions` holds. Returns the updated
    /// run when applied, or `Ok(None)` when the CAS was rejected — rejection
    /// is an expected outcome (concurrent actor won the race), not an error.
    async fn cas_update(
        &self,
        run_id: &str,
        expected_version: i64,
        updates: RunFieldUpdates,
        extra_conditions: RunExtraConditions,
    ) -> Result<Option<Run>, RunStoreError>;

    async fn scan_stuck_claimed(&self, older_than: Duration) -> Result<Vec<Run>, RunStoreError>;

    async fn scan_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Run>, RunStoreError>;
}

#[must_use]
pub fn memory() -> Arc<dyn RunStore> {
    Arc::new(MemoryRunStore::default())
}

#[derive(Default)]
struct MemoryRunStore {
    inner: Mutex<MemoryRunStoreInner>,
}

#[derive(Default)]
struct MemoryRunStoreInner {
    runs: HashMap<String, Run>,
    idempotency_index: HashMap<(String, String), String>,
}

fn extra_conditions_hold(run: &Run, conditions: &RunExtraConditions) -> bool {
    if let Some(expected) = conditions.status {
        if run.status != expected {
            return false;
        }
    }
    if let Some(expected) = conditions.finalize_stage {
        if run.finalize_stage != expected {
            return false;
        }
    }
    if let Some(expected) = conditions.money_state {
        if run.money_state != expected {
            return false;
        }
    }
    if let Some(expected_token) = conditions.finalize_token.as_deref() {
        if run.finalize_token.as_deref() != Some(expected_token) {
            return false;
        }
    }
    if let Some(before) = conditions.finalize_claimed_before {
        match run.finalize_claimed_at {
            Some(claimed_at) if claimed_at < before => {}
            _ => return false,
        }
    }
    true
}

fn apply_updates(run: &mut Run, updates: RunFieldUpdates, now: DateTime<Utc>) {
    if let Some(status) = updates.status {
        run.status = status;
    }
    if let Some(money_state) = updates.money_state {
        run.money_state = money_state;
    }
    if let Some(finalize_stage) = updates.finalize_stage {
        run.finalize_stage = finalize_stage;
    }
    if let Some(finalize_token) = updates.finalize_token {
        run.finalize_token = finalize_token;
    }
    if let Some(finalize_claimed_at) = updates.finalize_claimed_at {
        run.finalize_claimed_at = finalize_claimed_at;
    }
    if let Some(lease_token) = updates.lease_token {
        run.lease_token = lease_token;
    }
    if let Some(lease_expires_at) = updates.lease_expires_at {
        run.lease_expires_at = lease_expires_at;
    }
    if let Some(actual_cost) = updates.actual_cost {
        run.actual_cost = actual_cost;
    }
    if let Some(result_key) = updates.result_key {
        run.result_key = result_key;
    }
    if let Some(result_hash) = updates.result_hash {
        run.result_hash = result_hash;
    }
    if let Some(reason) = updates.last_error_reason_code {
        run.last_error_reason_code = reason;
    }
    run.version += 1;
    run.updated_at = now;
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create(&self, run: Run) -> Result<Run, RunStoreError> {
        let mut inner = self.inner.lock().await;
        if inner.runs.contains_key(&run.run_id) {
            return Err(RunStoreError::AlreadyExists(run.run_id));
        }
        if let Some(idempotency_key) = run.idempotency_key.clone() {
            let index_key = (run.tenant_id.clone(), idempotency_key);
            if let Some(existing_run_id) = inner.idempotency_index.get(&index_key) {
                if existing_run_id != &run.run_id {
                    return Err(RunStoreError::IdempotencyConflict(run.tenant_id));
                }
            }
            inner.idempotency_index.insert(index_key, run.run_id.clone());
        }
        inner.runs.insert(run.run_id.clone(), run.clone());
        Ok(run)
    }

    async fn load(&self, run_id: &str) -> Result<Option<Run>, RunStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.runs.get(run_id).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<Run>, RunStoreError> {
        let inner = self.inner.lock().await;
        let key = (tenant_id.to_string(), idempotency_key.to_string());
        Ok(inner
            .idempotency_index
            .get(&key)
            .and_then(|run_id| inner.runs.get(run_id))
            .cloned())
    }

    async fn cas_update(
        &self,
        run_id: &str,
        expected_version: i64,
        updates: RunFieldUpdates,
        extra_conditions: RunExtraConditions,
    ) -> Result<Option<Run>, RunStoreError> {
        let mut inner = self.inner.lock().await;
        let Some(run) = inner.runs.get_mut(run_id) else {
            return Err(RunStoreError::NotFound(run_id.to_string()));
        };
        if run.version != expected_version || !extra_conditions_hold(run, &extra_conditions) {
            return Ok(None);
        }
        apply_updates(run, updates, Utc::now());
        Ok(Some(run.clone()))
    }

    async fn scan_stuck_claimed(&self, older_than: Duration) -> Result<Vec<Run>, RunStoreError> {
        let inner = self.inner.lock().await;
        let threshold = Utc::now() - older_than;
        Ok(inner
            .runs
            .values()
            .filter(|run| {
                run.finalize_stage == FinalizeStage::Claimed
                    && run.finalize_claimed_at.is_some_and(|at| at < threshold)
            })
            .cloned()
            .collect())
    }

    async fn scan_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Run>, RunStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .runs
            .values()
            .filter(|run| {
                run.status == RunStatus::Processing
                    && run.lease_expires_at.is_some_and(|at| at < now)
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Money;

    fn sample_run(run_id: &str) -> Run {
        Run::new(
            run_id.to_string(),
            "tenant-1".to_string(),
            serde_json::json!({"kind": "fetch_url"}),
            Money::parse_fixed4("1.5000").unwrap(),
            Money::ZERO,
            None,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn create_rejects_duplicate_run_id() {
        let store = memory();
        store.create(sample_run("run-1")).await.unwrap();
        let err = store.create(sample_run("run-1")).await.unwrap_err();
        assert!(matches!(err, RunStoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn cas_update_rejects_stale_version() {
        let store = memory();
        store.create(sample_run("run-1")).await.unwrap();
        let applied = store
            .cas_update(
                "run-1",
                99,
                RunFieldUpdates {
                    status: Some(RunStatus::Processing),
                    ..Default::default()
                },
                RunExtraConditions::default(),
            )
            .await
            .unwrap();
        assert!(applied.is_none());
    }

    #[tokio::test]
    async fn cas_update_applies_and_bumps_version() {
        let store = memory();
        store.create(sample_run("run-1")).await.unwrap();
        let updated = store
            .cas_update(
                "run-1",
                1,
                RunFieldUpdates {
                    status: Some(RunStatus::Processing),
                    ..Default::default()
                },
                RunExtraConditions::default(),
            )
            .await
            .unwrap()
            .expect("cas should apply");
        assert_eq!(updated.version, 2);
        assert_eq!(updated.status, RunStatus::Processing);
    }

    #[tokio::test]
    async fn only_one_of_two_concurrent_claims_wins() {
        let store = memory();
        let mut run = sample_run("run-1");
        run.status = RunStatus::Processing;
        store.create(run).await.unwrap();

        let claim = |token: &'static str| {
            let store = store.clone();
            async move {
                store
                    .cas_update(
                        "run-1",
                        1,
                        RunFieldUpdates {
                            finalize_stage: Some(FinalizeStage::Claimed),
                            finalize_token: Some(Some(token.to_string())),
                            finalize_claimed_at: Some(Some(Utc::now())),
                            ..Default::default()
                        },
                        RunExtraConditions {
                            finalize_stage: Some(FinalizeStage::Unclaimed),
                            ..Default::default()
                        },
                    )
                    .await
                    .unwrap()
            }
        };

        let (first, second) = tokio::join!(claim("worker-a"), claim("worker-b"));
        let applied_count = usize::from(first.is_some()) + usize::from(second.is_some());
        assert_eq!(applied_count, 1);
    }
}
