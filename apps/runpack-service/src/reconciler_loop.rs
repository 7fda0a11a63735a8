use std::time::Duration;

use chrono::Utc;
use runpack_core::reconciler;

use crate::server::AppState;

/// Runs both Reconciler sweeps (spec.md §4.4) on `ttls.sweep_period`,
/// embedded in the service process. Mirrors the teacher's
/// `maybe_spawn_treasury_reconciliation_worker` loop shape.
pub async fn run(state: AppState) {
    let period = state
        .config
        .ttls
        .sweep_period
        .to_std()
        .unwrap_or(Duration::from_secs(60));

    loop {
        tokio::time::sleep(period).await;
        let now = Utc::now();

        match reconciler::sweep_expired_leases(
            state.run_store.as_ref(),
            state.budget.as_ref(),
            state.config.default_minimum_fee,
            now,
        )
        .await
        {
            Ok(summary) if summary.expired_leases_finalized > 0 || summary.races_lost > 0 => {
                tracing::info!(
                    expired_leases_finalized = summary.expired_leases_finalized,
                    races_lost = summary.races_lost,
                    "reconciler: expired-lease sweep"
                );
            }
            Ok(_) => {}
            Err(error) => tracing::error!(error = %error, "reconciler: expired-lease sweep failed"),
        }

        match reconciler::sweep_stuck_claimed(
            state.run_store.as_ref(),
            state.budget.as_ref(),
            state.object_store.as_ref(),
            &state.config.ttls,
            now,
        )
        .await
        {
            Ok(summary)
                if summary.stuck_claims_adopted > 0
                    || summary.stuck_force_settled > 0
                    || summary.audit_required > 0 =>
            {
                tracing::info!(
                    stuck_claims_adopted = summary.stuck_claims_adopted,
                    stuck_force_settled = summary.stuck_force_settled,
                    audit_required = summary.audit_required,
                    races_lost = summary.races_lost,
                    "reconciler: stuck-claimed sweep"
                );
                if summary.audit_required > 0 {
                    tracing::warn!(
                        audit_required = summary.audit_required,
                        "reconciler: runs marked AUDIT_REQUIRED, needs manual review"
                    );
                }
            }
            Ok(_) => {}
            Err(error) => tracing::error!(error = %error, "reconciler: stuck-claimed sweep failed"),
        }
    }
}
