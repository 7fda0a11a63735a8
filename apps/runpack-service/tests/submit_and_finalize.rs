//! End-to-end HTTP surface test: submit a run, lease it, finalize it, and
//! poll for the result, driving `build_router` in-process via `tower`
//! rather than binding a real socket (mirrors `apps/runtime/src/server/tests.rs`).

use std::net::SocketAddr;
use std::sync::Arc;

use base64::Engine;
use chrono::Utc;
use http_body_util::BodyExt;
use runpack_core::budget::MemoryBudgetEngine;
use runpack_core::{BudgetEngine, Money, Ttls};
use runpack_service::config::Config;
use runpack_service::server::{build_router, AppState};
use serde_json::{json, Value};
use tower::ServiceExt;

fn test_config() -> Config {
    Config {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        service_name: "runpack-test".to_string(),
        database_url: None,
        ttls: Ttls::default(),
        default_soft_limit: Money::ZERO,
        default_minimum_fee: Money::parse_fixed4("0.0100").unwrap(),
    }
}

/// Builds app state, returning the concrete budget handle alongside it so
/// tests can seed/inspect balances — `AppState::budget` is `Arc<dyn
/// BudgetEngine>`, which hides the memory fixture's `credit`/`balance`
/// helpers behind the narrower trait surface.
async fn test_state() -> (AppState, Arc<MemoryBudgetEngine>) {
    let config = test_config();
    let run_store = runpack_core::run_store::memory();
    let budget = Arc::new(runpack_core::budget::memory(config.ttls.t_res));
    budget
        .credit("tenant-1", Money::parse_fixed4("10.0000").unwrap())
        .await;
    let object_store = Arc::new(runpack_core::object_store::memory());
    let dispatcher = Arc::new(runpack_core::queue::memory());

    let state = AppState::new(
        config,
        run_store,
        budget.clone(),
        object_store,
        dispatcher,
        Utc::now(),
    );
    (state, budget)
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).expect("valid json body")
}

#[tokio::test]
async fn submit_then_poll_returns_queued_run() {
    let (state, _budget) = test_state().await;
    let router = build_router(state);

    let response = router
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri("/v1/runs")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(
                    json!({
                        "tenant_id": "tenant-1",
                        "pack_spec": {"kind": "fetch_url", "url": "https://example.com"},
                        "max_cost": "1.5000"
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), axum::http::StatusCode::CREATED);
    let body = json_body(response).await;
    assert_eq!(body["run"]["status"], "QUEUED");
    assert_eq!(body["run"]["money_state"], "RESERVED");
}

#[tokio::test]
async fn full_lifecycle_reaches_completed_and_settles() {
    let (state, budget) = test_state().await;
    let router = build_router(state);

    let submit_response = router
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri("/v1/runs")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(
                    json!({
                        "tenant_id": "tenant-1",
                        "pack_spec": {"kind": "fetch_url"},
                        "max_cost": "1.5000"
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    let submitted = json_body(submit_response).await;
    let run_id = submitted["run"]["run_id"].as_str().unwrap().to_string();

    let lease_response = router
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri(format!("/internal/v1/runs/{run_id}/lease"))
                .header("content-type", "application/json")
                .body(axum::body::Body::from(
                    json!({"lease_token": "worker-1", "lease_ttl_seconds": 360}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    let leased = json_body(lease_response).await;
    assert_eq!(leased["acquired"], true);

    let payload = base64::engine::general_purpose::STANDARD.encode(b"result bytes");
    let finalize_response = router
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri(format!("/internal/v1/runs/{run_id}/finalize"))
                .header("content-type", "application/json")
                .body(axum::body::Body::from(
                    json!({
                        "outcome": "success",
                        "worker_token": "worker-1",
                        "payload": payload,
                        "content_hash": "deadbeef",
                        "actual_cost": "1.0000"
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    let finalized = json_body(finalize_response).await;
    assert_eq!(finalized["outcome"], "committed");
    assert_eq!(finalized["run"]["status"], "COMPLETED");
    assert_eq!(finalized["run"]["money_state"], "SETTLED");

    let poll_response = router
        .oneshot(
            axum::http::Request::builder()
                .method("GET")
                .uri(format!("/v1/runs/{run_id}"))
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let polled = json_body(poll_response).await;
    assert_eq!(polled["run"]["status"], "COMPLETED");
    assert_eq!(budget.balance("tenant-1").await, Money::parse_fixed4("9.0000").unwrap());
}

#[tokio::test]
async fn submit_with_insufficient_budget_returns_conflict() {
    let (state, budget) = test_state().await;
    // Drain the seeded balance down to below the requested max_cost.
    budget
        .reserve(
            "tenant-1",
            "drain",
            Money::parse_fixed4("9.9900").unwrap(),
            Money::ZERO,
        )
        .await
        .unwrap();
    let router = build_router(state);

    let response = router
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri("/v1/runs")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(
                    json!({
                        "tenant_id": "tenant-1",
                        "pack_spec": {"kind": "fetch_url"},
                        "max_cost": "1.0000"
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), axum::http::StatusCode::CONFLICT);
    let body = json_body(response).await;
    assert_eq!(body["error"], "budget_exceeded");
}
