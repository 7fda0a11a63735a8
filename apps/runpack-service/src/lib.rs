#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use runpack_core::{BudgetEngine, Dispatcher, ObjectStore, RunStore};
use tokio::net::TcpListener;
use tracing::info;

pub mod config;
pub mod executor;
pub mod reconciler_loop;
pub mod server;

use config::Config;
use server::AppState;

/// Bounded-timeout budget shared by the service's router and the worker's
/// `reqwest::Client` (spec.md, "all I/O calls must have bounded timeouts
/// strictly less than `lease_ttl / 3`"). One third less a one-second margin
/// so the bound stays strict even when `lease_ttl` is configured small.
#[must_use]
pub fn io_timeout_from_lease_ttl_seconds(lease_ttl_seconds: i64) -> Duration {
    let bound = (lease_ttl_seconds.max(0) as u64 / 3).saturating_sub(1).max(1);
    Duration::from_secs(bound)
}

/// Assembles the in-process `AppState` backing both the HTTP surface and
/// the embedded Reconciler loop. The Run Store is Postgres-backed when
/// `config.database_url` is set, falling back to the in-memory fixture
/// otherwise (dev mode) — mirroring the teacher's `build_runtime_state`
/// optional-`db` pattern in `apps/runtime/src/lib.rs`.
pub async fn build_state(config: Config) -> Result<AppState> {
    let run_store: Arc<dyn RunStore> = match &config.database_url {
        Some(url) => {
            let db = Arc::new(runpack_core::PgClient::connect(url).await?);
            Arc::new(runpack_core::PostgresRunStore::new(db))
        }
        None => runpack_core::run_store::memory(),
    };
    let budget: Arc<dyn BudgetEngine> = Arc::new(runpack_core::budget::memory(config.ttls.t_res));
    let object_store: Arc<dyn ObjectStore> = Arc::new(runpack_core::object_store::memory());
    let dispatcher: Arc<dyn Dispatcher> = Arc::new(runpack_core::queue::memory());

    Ok(AppState::new(
        config,
        run_store,
        budget,
        object_store,
        dispatcher,
        Utc::now(),
    ))
}

pub async fn build_app(config: Config) -> Result<axum::Router> {
    Ok(server::build_router(build_state(config).await?))
}

/// Serves the HTTP API and spawns the embedded Reconciler loop
/// (spec.md §4.4's two sweeps on `config.ttls.sweep_period`) alongside it,
/// exactly as `apps/runpack-service` is specified to in SPEC_FULL.md §A.
pub async fn serve(config: Config) -> Result<()> {
    let state = build_state(config).await?;
    let reconciler_handle = tokio::spawn(reconciler_loop::run(state.clone()));

    let listener = TcpListener::bind(state.config.bind_addr).await?;
    info!(
        service = %state.config.service_name,
        bind_addr = %state.config.bind_addr,
        "runpack service listening"
    );
    axum::serve(listener, server::build_router(state)).await?;
    reconciler_handle.abort();
    Ok(())
}
