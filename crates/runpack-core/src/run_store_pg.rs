//! Postgres-backed [`RunStore`]. Mirrors the teacher's `PostgresCreditStore`
//! (`credit/store.rs`): a single connection behind a mutex, one
//! transaction per call, rows mapped by hand rather than via an ORM.
//!
//! `cas_update` is a single `UPDATE ... WHERE run_id = $1 AND version = $2
//! AND <extra predicates> RETURNING *`. Postgres's row-level locking inside
//! the implicit statement transaction gives the single-row atomicity
//! spec.md §4.1 requires without needing an explicit `SELECT ... FOR UPDATE`
//! first — the predicate is evaluated against the same row version the
//! write commits.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio_postgres::Row;

use crate::db::PgClient;
use crate::money::Money;
use crate::run::{FinalizeStage, MoneyState, Run, RunExtraConditions, RunFieldUpdates, RunStatus};
use crate::run_store::{RunStore, RunStoreError};

pub struct PostgresRunStore {
    db: Arc<PgClient>,
}

impl PostgresRunStore {
    #[must_use]
    pub fn new(db: Arc<PgClient>) -> Self {
        Self { db }
    }
}

fn status_to_str(status: RunStatus) -> &'static str {
    status.as_str()
}

fn status_from_str(value: &str) -> Result<RunStatus, RunStoreError> {
    match value {
        "QUEUED" => Ok(RunStatus::Queued),
        "PROCESSING" => Ok(RunStatus::Processing),
        "COMPLETED" => Ok(RunStatus::Completed),
        "FAILED" => Ok(RunStatus::Failed),
        "EXPIRED" => Ok(RunStatus::Expired),
        other => Err(RunStoreError::Store(format!("unknown status: {other}"))),
    }
}

fn money_state_from_str(value: &str) -> Result<MoneyState, RunStoreError> {
    match value {
        "NONE" => Ok(MoneyState::None),
        "RESERVED" => Ok(MoneyState::Reserved),
        "SETTLED" => Ok(MoneyState::Settled),
        "REFUNDED" => Ok(MoneyState::Refunded),
        "AUDIT_REQUIRED" => Ok(MoneyState::AuditRequired),
        other => Err(RunStoreError::Store(format!("unknown money_state: {other}"))),
    }
}

fn finalize_stage_from_str(value: &str) -> Result<FinalizeStage, RunStoreError> {
    match value {
        "UNCLAIMED" => Ok(FinalizeStage::Unclaimed),
        "CLAIMED" => Ok(FinalizeStage::Claimed),
        "COMMITTED" => Ok(FinalizeStage::Committed),
        other => Err(RunStoreError::Store(format!("unknown finalize_stage: {other}"))),
    }
}

fn row_to_run(row: &Row) -> Result<Run, RunStoreError> {
    Ok(Run {
        run_id: row.get("run_id"),
        tenant_id: row.get("tenant_id"),
        version: row.get("version"),
        status: status_from_str(row.get("status"))?,
        money_state: money_state_from_str(row.get("money_state"))?,
        finalize_stage: finalize_stage_from_str(row.get("finalize_stage"))?,
        finalize_token: row.get("finalize_token"),
        finalize_claimed_at: row.get("finalize_claimed_at"),
        lease_token: row.get("lease_token"),
        lease_expires_at: row.get("lease_expires_at"),
        reservation_max_cost: Money::from_micros(row.get("reservation_max_cost_micros")),
        actual_cost: row
            .get::<_, Option<i64>>("actual_cost_micros")
            .map(Money::from_micros),
        minimum_fee: Money::from_micros(row.get("minimum_fee_micros")),
        result_key: row.get("result_key"),
        result_hash: row.get("result_hash"),
        last_error_reason_code: row.get("last_error_reason_code"),
        idempotency_key: row.get("idempotency_key"),
        pack_spec: row.get("pack_spec"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl RunStore for PostgresRunStore {
    async fn create(&self, run: Run) -> Result<Run, RunStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let result = client
            .execute(
                r#"
                INSERT INTO runs (
                    run_id, tenant_id, version, status, money_state, finalize_stage,
                    finalize_token, finalize_claimed_at, lease_token, lease_expires_at,
                    reservation_max_cost_micros, actual_cost_micros, minimum_fee_micros,
                    result_key, result_hash, last_error_reason_code, idempotency_key,
                    pack_spec, created_at, updated_at
                ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20)
                "#,
                &[
                    &run.run_id,
                    &run.tenant_id,
                    &run.version,
                    &status_to_str(run.status),
                    &run.money_state.as_str(),
                    &run.finalize_stage.as_str(),
                    &run.finalize_token,
                    &run.finalize_claimed_at,
                    &run.lease_token,
                    &run.lease_expires_at,
                    &run.reservation_max_cost.micros(),
                    &run.actual_cost.map(Money::micros),
                    &run.minimum_fee.micros(),
                    &run.result_key,
                    &run.result_hash,
                    &run.last_error_reason_code,
                    &run.idempotency_key,
                    &run.pack_spec,
                    &run.created_at,
                    &run.updated_at,
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(run),
            Err(error) => match error.as_db_error().and_then(|db| db.constraint()) {
                Some("runs_pkey") => Err(RunStoreError::AlreadyExists(run.run_id)),
                Some("runs_tenant_idempotency_key_idx") => {
                    Err(RunStoreError::IdempotencyConflict(run.tenant_id))
                }
                _ => Err(RunStoreError::Store(error.to_string())),
            },
        }
    }

    async fn load(&self, run_id: &str) -> Result<Option<Run>, RunStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt("SELECT * FROM runs WHERE run_id = $1", &[&run_id])
            .await
            .map_err(|error| RunStoreError::Store(error.to_string()))?;
        row.as_ref().map(row_to_run).transpose()
    }

    async fn find_by_idempotency_key(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<Run>, RunStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                "SELECT * FROM runs WHERE tenant_id = $1 AND idempotency_key = $2",
                &[&tenant_id, &idempotency_key],
            )
            .await
            .map_err(|error| RunStoreError::Store(error.to_string()))?;
        row.as_ref().map(row_to_run).transpose()
    }

    async fn cas_update(
        &self,
        run_id: &str,
        expected_version: i64,
        updates: RunFieldUpdates,
        extra_conditions: RunExtraConditions,
    ) -> Result<Option<Run>, RunStoreError> {
        type BoxedParam = Box<dyn tokio_postgres::types::ToSql + Sync + Send>;

        let mut set_clauses = vec![
            "version = version + 1".to_string(),
            "updated_at = now()".to_string(),
        ];
        let mut where_clauses = vec!["run_id = $1".to_string(), "version = $2".to_string()];
        // Fixed params occupy $1/$2; every optional predicate below is
        // appended in order and numbered starting at $3.
        let mut dynamic: Vec<BoxedParam> = Vec::new();

        macro_rules! push_set {
            ($value:expr, $column:literal) => {
                if let Some(value) = $value {
                    let index = 3 + dynamic.len();
                    set_clauses.push(format!("{} = ${}", $column, index));
                    dynamic.push(Box::new(value));
                }
            };
        }
        macro_rules! push_where {
            ($value:expr, $clause:literal) => {
                if let Some(value) = $value {
                    let index = 3 + dynamic.len();
                    where_clauses.push(format!($clause, index));
                    dynamic.push(Box::new(value));
                }
            };
        }

        push_set!(updates.status.map(status_to_str), "status");
        push_set!(updates.money_state.map(|m| m.as_str()), "money_state");
        push_set!(updates.finalize_stage.map(|f| f.as_str()), "finalize_stage");
        push_set!(updates.finalize_token, "finalize_token");
        push_set!(updates.finalize_claimed_at, "finalize_claimed_at");
        push_set!(updates.lease_token, "lease_token");
        push_set!(updates.lease_expires_at, "lease_expires_at");
        push_set!(updates.actual_cost.map(|v| v.map(Money::micros)), "actual_cost_micros");
        push_set!(updates.result_key, "result_key");
        push_set!(updates.result_hash, "result_hash");
        push_set!(updates.last_error_reason_code, "last_error_reason_code");

        push_where!(
            extra_conditions.status.map(status_to_str),
            "status = ${}"
        );
        push_where!(
            extra_conditions.finalize_stage.map(|f| f.as_str()),
            "finalize_stage = ${}"
        );
        push_where!(
            extra_conditions.money_state.map(|m| m.as_str()),
            "money_state = ${}"
        );
        push_where!(extra_conditions.finalize_token, "finalize_token = ${}");
        push_where!(
            extra_conditions.finalize_claimed_before,
            "finalize_claimed_at < ${}"
        );

        let sql = format!(
            "UPDATE runs SET {} WHERE {} RETURNING *",
            set_clauses.join(", "),
            where_clauses.join(" AND ")
        );

        let mut params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> =
            vec![&run_id, &expected_version];
        params.extend(dynamic.iter().map(|boxed| boxed.as_ref() as &(dyn tokio_postgres::types::ToSql + Sync)));

        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(&sql, &params)
            .await
            .map_err(|error| RunStoreError::Store(error.to_string()))?;
        row.as_ref().map(row_to_run).transpose()
    }

    async fn scan_stuck_claimed(&self, older_than: Duration) -> Result<Vec<Run>, RunStoreError> {
        let threshold = Utc::now() - older_than;
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                "SELECT * FROM runs WHERE finalize_stage = 'CLAIMED' AND finalize_claimed_at < $1",
                &[&threshold],
            )
            .await
            .map_err(|error| RunStoreError::Store(error.to_string()))?;
        rows.iter().map(row_to_run).collect()
    }

    async fn scan_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Run>, RunStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                "SELECT * FROM runs WHERE status = 'PROCESSING' AND lease_expires_at < $1",
                &[&now],
            )
            .await
            .map_err(|error| RunStoreError::Store(error.to_string()))?;
        rows.iter().map(row_to_run).collect()
    }
}
