use anyhow::{Context, Result};
use tokio_postgres::NoTls;

const MIGRATION_0001: &str = include_str!("../../migrations/0001_init.sql");

/// Applies the Run Store schema. Idempotent — every statement is
/// `CREATE ... IF NOT EXISTS` — so this can run on every deploy, the way
/// the teacher's `runtime-migrate` binary is driven from CI.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let database_url = std::env::var("DATABASE_URL")
        .or_else(|_| std::env::var("DB_URL"))
        .context("DATABASE_URL (or DB_URL) must be set")?;

    let (client, connection) = tokio_postgres::connect(&database_url, NoTls)
        .await
        .context("connect to postgres")?;
    tokio::spawn(async move {
        if let Err(error) = connection.await {
            tracing::error!(reason = %error, "runpack-migrate connection error");
        }
    });

    client
        .batch_execute(MIGRATION_0001)
        .await
        .context("apply 0001_init.sql")?;

    tracing::info!("runpack schema migrated");
    Ok(())
}
