use chrono::{DateTime, Utc};

use crate::run::{Run, RunExtraConditions, RunFieldUpdates, RunStatus};
use crate::run_store::{RunStore, RunStoreError};

/// Worker visibility lease acquisition: `QUEUED -> PROCESSING` (spec.md §3,
/// "transitions to PROCESSING when a worker acquires a lease"). A single CAS
/// against the Run Store, scoped to `status = QUEUED` so two workers racing
/// to pick up the same dispatch message cannot both start executing it.
/// Returns `Ok(None)` when another worker already won the race — this is an
/// expected outcome, not an error (spec.md §7, "Race" kind).
pub async fn acquire_lease(
    run_store: &dyn RunStore,
    run: &Run,
    lease_token: &str,
    lease_expires_at: DateTime<Utc>,
) -> Result<Option<Run>, RunStoreError> {
    run_store
        .cas_update(
            &run.run_id,
            run.version,
            RunFieldUpdates {
                status: Some(RunStatus::Processing),
                lease_token: Some(Some(lease_token.to_string())),
                lease_expires_at: Some(Some(lease_expires_at)),
                ..Default::default()
            },
            RunExtraConditions {
                status: Some(RunStatus::Queued),
                ..Default::default()
            },
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Money;
    use crate::run_store::memory;
    use chrono::Duration;

    fn sample_run(run_id: &str) -> Run {
        Run::new(
            run_id.to_string(),
            "tenant-1".to_string(),
            serde_json::json!({"kind": "fetch_url"}),
            Money::parse_fixed4("1.0000").unwrap(),
            Money::ZERO,
            None,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn acquire_lease_transitions_queued_to_processing() {
        let store = memory();
        let run = store.create(sample_run("run-1")).await.unwrap();

        let leased = acquire_lease(
            store.as_ref(),
            &run,
            "worker-token",
            Utc::now() + Duration::minutes(6),
        )
        .await
        .unwrap()
        .expect("lease should be acquired");

        assert_eq!(leased.status, RunStatus::Processing);
        assert_eq!(leased.lease_token.as_deref(), Some("worker-token"));
    }

    #[tokio::test]
    async fn only_one_of_two_concurrent_lease_attempts_wins() {
        let store = memory();
        let run = store.create(sample_run("run-1")).await.unwrap();

        let attempt = |token: &'static str| {
            let store = store.clone();
            let run = run.clone();
            async move {
                acquire_lease(store.as_ref(), &run, token, Utc::now() + Duration::minutes(6))
                    .await
                    .unwrap()
            }
        };

        let (first, second) = tokio::join!(attempt("worker-a"), attempt("worker-b"));
        let won = usize::from(first.is_some()) + usize::from(second.is_some());
        assert_eq!(won, 1);
    }

    #[tokio::test]
    async fn redelivered_message_for_terminal_run_cannot_reacquire_lease() {
        let store = memory();
        let mut run = sample_run("run-1");
        run.status = RunStatus::Completed;
        let run = store.create(run).await.unwrap();

        let leased = acquire_lease(
            store.as_ref(),
            &run,
            "worker-token",
            Utc::now() + Duration::minutes(6),
        )
        .await
        .unwrap();

        assert!(leased.is_none());
        let stored = store.load("run-1").await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
    }
}
