use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use rand::Rng;
use runpack_core::DispatchMessage;
use serde::{Deserialize, Serialize};

/// Standalone worker process: polls the service's internal queue, leases
/// a run, executes the pack (a deterministic stub — see
/// `runpack_service::executor`), and reports the outcome back through the
/// Finalize Protocol. Talks to `runpack-service` over HTTP only, the way
/// the teacher's vignette binaries drive a running service via `reqwest`
/// rather than linking its internals directly.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let base_url =
        std::env::var("RUNPACK_SERVICE_URL").unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());
    let poll_interval = std::env::var("RUNPACK_WORKER_POLL_INTERVAL_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(500);
    let lease_ttl_seconds = std::env::var("RUNPACK_LEASE_TTL_SECONDS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(360);

    let worker_id = format!("worker-{}", uuid::Uuid::new_v4());
    let client = reqwest::Client::builder()
        .timeout(runpack_service::io_timeout_from_lease_ttl_seconds(
            lease_ttl_seconds,
        ))
        .build()
        .context("build http client")?;

    tracing::info!(worker_id, base_url, "runpack worker starting");

    loop {
        match poll_and_process(&client, &base_url, &worker_id).await {
            Ok(true) => {}
            Ok(false) => tokio::time::sleep(Duration::from_millis(poll_interval)).await,
            Err(error) => {
                tracing::error!(error = %error, "worker poll cycle failed");
                tokio::time::sleep(Duration::from_millis(poll_interval)).await;
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueueNextResponse {
    message: Option<DispatchMessage>,
}

#[derive(Debug, Serialize)]
struct LeaseRunBody {
    lease_token: String,
    lease_ttl_seconds: i64,
}

#[derive(Debug, Deserialize)]
struct LeaseRunResponse {
    acquired: bool,
    run: Option<runpack_core::Run>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum FinalizeRunBody {
    Success {
        worker_token: String,
        payload: String,
        content_hash: String,
        actual_cost: String,
    },
    Failure {
        worker_token: String,
        reason_code: String,
    },
}

/// Returns `Ok(true)` when a message was found (whether or not this
/// worker won the lease race), `Ok(false)` when the queue was empty.
async fn poll_and_process(client: &reqwest::Client, base_url: &str, worker_id: &str) -> Result<bool> {
    let next: QueueNextResponse = client
        .get(format!("{base_url}/internal/v1/queue/next"))
        .send()
        .await
        .context("poll queue/next")?
        .error_for_status()
        .context("queue/next returned an error status")?
        .json()
        .await
        .context("decode queue/next response")?;

    let Some(message) = next.message else {
        return Ok(false);
    };

    let lease_token = format!("{worker_id}-{}", rand::thread_rng().gen::<u32>());
    let lease: LeaseRunResponse = client
        .post(format!(
            "{base_url}/internal/v1/runs/{}/lease",
            message.run_id
        ))
        .json(&LeaseRunBody {
            lease_token: lease_token.clone(),
            lease_ttl_seconds: message.lease_ttl_seconds,
        })
        .send()
        .await
        .context("acquire lease")?
        .error_for_status()
        .context("lease endpoint returned an error status")?
        .json()
        .await
        .context("decode lease response")?;

    if !lease.acquired {
        tracing::debug!(run_id = %message.run_id, "lease lost the race, skipping");
        return Ok(true);
    }
    let Some(run) = lease.run else {
        return Ok(true);
    };

    let outcome = runpack_service::executor::execute(&message.pack_spec, run.reservation_max_cost);
    let finalize_token = format!("{worker_id}-finalize-{}", rand::thread_rng().gen::<u32>());

    let body = FinalizeRunBody::Success {
        worker_token: finalize_token,
        payload: base64::engine::general_purpose::STANDARD.encode(&outcome.payload),
        content_hash: outcome.content_hash,
        actual_cost: outcome.actual_cost.to_fixed4(),
    };

    let response = client
        .post(format!(
            "{base_url}/internal/v1/runs/{}/finalize",
            message.run_id
        ))
        .json(&body)
        .send()
        .await
        .context("submit finalize")?
        .error_for_status()
        .context("finalize endpoint returned an error status")?
        .json::<serde_json::Value>()
        .await
        .context("decode finalize response")?;

    tracing::info!(run_id = %message.run_id, outcome = %response["outcome"], "worker finalized run");
    Ok(true)
}
