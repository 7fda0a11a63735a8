//! Shared Postgres connection wrapper for the `postgres`-backed store
//! implementations. Mirrors the teacher's `RuntimeDb`: a single connection,
//! held behind a mutex, with the connection driver task spawned off to run
//! independently (`tokio_postgres::connect` splits client/connection).

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("failed to connect to postgres: {0}")]
    Connect(String),
}

#[derive(Clone)]
pub struct PgClient {
    client: Arc<Mutex<Client>>,
}

impl PgClient {
    pub async fn connect(database_url: &str) -> Result<Self, DbError> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(|error| DbError::Connect(error.to_string()))?;

        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::error!(reason = %error, "runpack postgres connection error");
            }
        });

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    #[must_use]
    pub fn client(&self) -> Arc<Mutex<Client>> {
        self.client.clone()
    }
}
