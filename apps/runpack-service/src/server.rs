use std::sync::Arc;

use axum::{
    BoxError, Json, Router,
    error_handling::HandleErrorLayer,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use runpack_core::{
    BudgetEngine, Dispatcher, FinalizeResult, Money, ObjectStore, Run, RunStore, SubmissionError,
    SubmissionRequest,
};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower::timeout::TimeoutLayer;
use uuid::Uuid;

use crate::config::Config;
use crate::io_timeout_from_lease_ttl_seconds;

/// Everything the HTTP surface and the embedded Reconciler loop need,
/// shared behind `Arc` handles the way the teacher's `AppState` threads
/// its subsystem services (`apps/runtime/src/server.rs`).
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub run_store: Arc<dyn RunStore>,
    pub budget: Arc<dyn BudgetEngine>,
    pub object_store: Arc<dyn ObjectStore>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: Config,
        run_store: Arc<dyn RunStore>,
        budget: Arc<dyn BudgetEngine>,
        object_store: Arc<dyn ObjectStore>,
        dispatcher: Arc<dyn Dispatcher>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            config,
            run_store,
            budget,
            object_store,
            dispatcher,
            started_at,
        }
    }
}

/// Converts a tower `Elapsed` (the request overran the bound below) into a
/// response; any other boxed error falls back to 500 rather than panicking
/// the connection.
async fn handle_timeout_error(error: BoxError) -> (StatusCode, String) {
    if error.is::<tower::timeout::error::Elapsed>() {
        (
            StatusCode::REQUEST_TIMEOUT,
            "request exceeded the bounded I/O timeout".to_string(),
        )
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, format!("unhandled error: {error}"))
    }
}

pub fn build_router(state: AppState) -> Router {
    let io_timeout = io_timeout_from_lease_ttl_seconds(state.config.ttls.lease_ttl.num_seconds());
    Router::new()
        .route("/healthz", get(health))
        .route("/readyz", get(readiness))
        .route("/v1/runs", post(submit_run))
        .route("/v1/runs/:run_id", get(get_run))
        .route("/internal/v1/queue/next", get(queue_next))
        .route("/internal/v1/runs/:run_id/lease", post(lease_run))
        .route("/internal/v1/runs/:run_id/finalize", post(finalize_run))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_timeout_error))
                .layer(TimeoutLayer::new(io_timeout)),
        )
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    uptime_seconds: i64,
    database_configured: bool,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: state.config.service_name.clone(),
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
        database_configured: state.config.database_url.is_some(),
    })
}

/// Readiness is a single cheap round trip to the Run Store — enough to
/// catch a dropped database connection without load-bearing the check on
/// the full dependency graph.
async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let ready = state.run_store.load("__readyz_probe__").await.is_ok();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(serde_json::json!({ "ready": ready })))
}

#[derive(Debug, Deserialize)]
struct SubmitRunBody {
    tenant_id: String,
    pack_spec: serde_json::Value,
    max_cost: String,
    #[serde(default)]
    minimum_fee: Option<String>,
    #[serde(default)]
    idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct RunResponse {
    run: Run,
}

async fn submit_run(
    State(state): State<AppState>,
    Json(body): Json<SubmitRunBody>,
) -> Result<(StatusCode, Json<RunResponse>), ApiError> {
    let max_cost = Money::parse_fixed4(&body.max_cost)
        .map_err(|error| ApiError::InvalidRequest(format!("max_cost: {error}")))?;
    let minimum_fee = match body.minimum_fee {
        Some(raw) => Money::parse_fixed4(&raw)
            .map_err(|error| ApiError::InvalidRequest(format!("minimum_fee: {error}")))?,
        None => state.config.default_minimum_fee,
    };

    let run = runpack_core::submission::submit(
        state.run_store.as_ref(),
        state.budget.as_ref(),
        state.dispatcher.as_ref(),
        SubmissionRequest {
            tenant_id: body.tenant_id,
            pack_spec: body.pack_spec,
            max_cost,
            minimum_fee,
            soft_limit: state.config.default_soft_limit,
            idempotency_key: body.idempotency_key,
            lease_ttl_seconds: state.config.ttls.lease_ttl.num_seconds(),
        },
    )
    .await?;

    Ok((StatusCode::CREATED, Json(RunResponse { run })))
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunResponse>, ApiError> {
    let run = state
        .run_store
        .load(&run_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(RunResponse { run }))
}

#[derive(Debug, Serialize)]
struct QueueNextResponse {
    message: Option<runpack_core::DispatchMessage>,
}

#[derive(Debug, Deserialize)]
struct LeaseRunBody {
    lease_token: String,
    lease_ttl_seconds: i64,
}

#[derive(Debug, Serialize)]
struct LeaseRunResponse {
    acquired: bool,
    run: Option<Run>,
}

/// Worker-facing lease acquisition (spec.md §3, `QUEUED -> PROCESSING`).
/// The worker has no direct Run Store access, so this wraps
/// [`runpack_core::acquire_lease`] the same way `finalize_run` wraps the
/// Finalize Protocol.
async fn lease_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(body): Json<LeaseRunBody>,
) -> Result<Json<LeaseRunResponse>, ApiError> {
    let run = state
        .run_store
        .load(&run_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    let leased = runpack_core::acquire_lease(
        state.run_store.as_ref(),
        &run,
        &body.lease_token,
        Utc::now() + chrono::Duration::seconds(body.lease_ttl_seconds),
    )
    .await?;

    Ok(Json(LeaseRunResponse {
        acquired: leased.is_some(),
        run: leased,
    }))
}

/// Polled by `runpack-worker`. Dequeues a dispatch message but does NOT
/// itself acquire the lease — the worker must still load the `Run` and
/// call [`runpack_core::acquire_lease`] against the Run Store, since the
/// queue and the Run Store are separate systems with no shared
/// transaction (spec.md §6).
async fn queue_next(State(state): State<AppState>) -> Result<Json<QueueNextResponse>, ApiError> {
    let message = state.dispatcher.dequeue().await.map_err(|error| {
        ApiError::Internal(format!("dispatcher error: {error}"))
    })?;
    Ok(Json(QueueNextResponse { message }))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum FinalizeRunBody {
    Success {
        worker_token: String,
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
        content_hash: String,
        actual_cost: String,
    },
    Failure {
        worker_token: String,
        reason_code: String,
    },
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Serialize)]
struct FinalizeResponse {
    outcome: &'static str,
    run: Option<Run>,
}

/// Worker-facing entry point into the two-phase Finalize Protocol
/// (spec.md §4.3). The worker has already executed the pack; this
/// endpoint only performs the claim/settle-or-refund/commit sequence.
async fn finalize_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(body): Json<FinalizeRunBody>,
) -> Result<Json<FinalizeResponse>, ApiError> {
    let run = state
        .run_store
        .load(&run_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    let result = match body {
        FinalizeRunBody::Success {
            worker_token,
            payload,
            content_hash,
            actual_cost,
        } => {
            let actual_cost = Money::parse_fixed4(&actual_cost)
                .map_err(|error| ApiError::InvalidRequest(format!("actual_cost: {error}")))?;
            runpack_core::finalize::finalize_success(
                state.run_store.as_ref(),
                state.budget.as_ref(),
                state.object_store.as_ref(),
                &run,
                &worker_token,
                &payload,
                &content_hash,
                actual_cost,
            )
            .await?
        }
        FinalizeRunBody::Failure {
            worker_token,
            reason_code,
        } => {
            runpack_core::finalize::finalize_failure(
                state.run_store.as_ref(),
                state.budget.as_ref(),
                &run,
                &worker_token,
                runpack_core::RunStatus::Failed,
                run.minimum_fee,
                &reason_code,
            )
            .await?
        }
    };

    let (outcome, run) = match result {
        FinalizeResult::Committed(run) => ("committed", Some(run)),
        FinalizeResult::Aborted(reason) => (abort_reason_str(reason), None),
    };
    Ok(Json(FinalizeResponse { outcome, run }))
}

fn abort_reason_str(reason: runpack_core::AbortReason) -> &'static str {
    use runpack_core::AbortReason;
    match reason {
        AbortReason::ClaimLost => "aborted_claim_lost",
        AbortReason::NoReserve => "aborted_no_reserve",
        AbortReason::CommitLost => "aborted_commit_lost",
    }
}

#[derive(Debug)]
enum ApiError {
    NotFound,
    InvalidRequest(String),
    Conflict(&'static str),
    Internal(String),
}

impl From<runpack_core::RunStoreError> for ApiError {
    fn from(error: runpack_core::RunStoreError) -> Self {
        Self::Internal(error.to_string())
    }
}

impl From<runpack_core::FinalizeError> for ApiError {
    fn from(error: runpack_core::FinalizeError) -> Self {
        Self::Internal(error.to_string())
    }
}

impl From<SubmissionError> for ApiError {
    fn from(error: SubmissionError) -> Self {
        match error {
            SubmissionError::BudgetExceeded => Self::Conflict("budget_exceeded"),
            SubmissionError::IdempotencyConflict => Self::Conflict("idempotency_conflict"),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            Self::NotFound => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": "not_found" })),
            )
                .into_response(),
            Self::InvalidRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "invalid_request", "message": message })),
            )
                .into_response(),
            Self::Conflict(code) => (
                StatusCode::CONFLICT,
                Json(serde_json::json!({ "error": code })),
            )
                .into_response(),
            Self::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "internal", "message": message })),
            )
                .into_response(),
        }
    }
}
