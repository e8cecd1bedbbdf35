use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection;
use tokio::sync::{Mutex, MutexGuard};

use crate::config::StorageConfig;
use crate::error::{is_connection_error, Error, ErrorDetails, IMPOSSIBLE_ERROR_MESSAGE};

mod quota_queries;
mod token_usage_queries;

pub use quota_queries::PostgresQuotaStore;

/// Owns at most one live connection to Postgres and replaces it when it dies.
///
/// The connection is not shareable between concurrent statements, so every
/// caller goes through `acquire`, which serializes access behind a mutex.
#[derive(Debug)]
pub struct PostgresConnectionManager {
    options: PgConnectOptions,
    connect_timeout: Duration,
    connection: Mutex<Option<PgConnection>>,
}

/// Exclusive access to the live connection for the duration of one statement.
pub struct PostgresConnectionGuard<'a> {
    guard: MutexGuard<'a, Option<PgConnection>>,
}

impl PostgresConnectionGuard<'_> {
    pub fn connection(&mut self) -> Result<&mut PgConnection, Error> {
        self.guard.as_mut().ok_or_else(|| {
            Error::new(ErrorDetails::InternalError {
                message: format!(
                    "Postgres connection missing after connecting. {IMPOSSIBLE_ERROR_MESSAGE}"
                ),
            })
        })
    }

    /// Converts a statement result, forgetting the connection if the failure means it is gone.
    /// The statement is not retried; the next call reconnects.
    pub fn check<T>(&mut self, result: Result<T, sqlx::Error>) -> Result<T, Error> {
        result.map_err(|e| {
            if is_connection_error(&e) {
                tracing::debug!("Dropping broken Postgres connection: {e}");
                *self.guard = None;
            }
            Error::from(e)
        })
    }
}

impl PostgresConnectionManager {
    pub fn new(options: PgConnectOptions, connect_timeout: Duration) -> Self {
        Self {
            options,
            connect_timeout,
            connection: Mutex::new(None),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self, Error> {
        Ok(Self::new(
            config.connect_options()?,
            Duration::from_secs(config.connect_timeout_s),
        ))
    }

    /// Builds a manager and opens the first connection, so that an unreachable store
    /// is reported at startup instead of on the first request.
    pub async fn connect(config: &StorageConfig) -> Result<Self, Error> {
        let manager = Self::from_config(config)?;
        manager.ensure_connected().await?;
        Ok(manager)
    }

    /// Returns true if we hold a connection and it answers a ping.
    pub async fn connected(&self) -> bool {
        let mut guard = self.connection.lock().await;
        probe(&mut guard).await
    }

    pub async fn ensure_connected(&self) -> Result<(), Error> {
        let mut guard = self.connection.lock().await;
        self.ensure_connected_locked(&mut guard).await
    }

    /// Drops the held connection. The next statement reconnects.
    pub async fn disconnect(&self) {
        let connection = self.connection.lock().await.take();
        if let Some(connection) = connection
            && let Err(e) = connection.close().await
        {
            tracing::debug!("Error while closing Postgres connection: {e}");
        }
    }

    /// Locks the connection, reconnecting first if needed.
    pub async fn acquire(&self) -> Result<PostgresConnectionGuard<'_>, Error> {
        let mut guard = self.connection.lock().await;
        self.ensure_connected_locked(&mut guard).await?;
        Ok(PostgresConnectionGuard { guard })
    }

    async fn ensure_connected_locked(
        &self,
        guard: &mut MutexGuard<'_, Option<PgConnection>>,
    ) -> Result<(), Error> {
        if probe(guard).await {
            return Ok(());
        }
        tracing::debug!("Opening a new Postgres connection");
        let connect = PgConnection::connect_with(&self.options);
        let connection = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                Error::new(ErrorDetails::StorageUnavailable {
                    message: format!(
                        "Timed out connecting to Postgres after {}s",
                        self.connect_timeout.as_secs()
                    ),
                })
            })?
            .map_err(|e| {
                Error::new(ErrorDetails::StorageUnavailable {
                    message: e.to_string(),
                })
            })?;
        **guard = Some(connection);
        Ok(())
    }
}

/// Liveness probe. A held connection that fails the ping is discarded.
async fn probe(guard: &mut MutexGuard<'_, Option<PgConnection>>) -> bool {
    let Some(connection) = guard.as_mut() else {
        return false;
    };
    match connection.ping().await {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!("Postgres liveness probe failed: {e}");
            **guard = None;
            false
        }
    }
}

/// Creates the quota tables if they do not exist yet.
pub async fn run_postgres_migrations(manager: &PostgresConnectionManager) -> Result<(), Error> {
    let mut guard = manager.acquire().await?;
    sqlx::migrate!("src/db/postgres/migrations")
        .run(guard.connection()?)
        .await?;
    Ok(())
}

pub async fn manual_run_postgres_migrations_with_url(postgres_url: &str) -> Result<(), Error> {
    let options: PgConnectOptions = postgres_url.parse().map_err(|e: sqlx::Error| {
        Error::new(ErrorDetails::Config {
            message: format!("Invalid Postgres URL: {e}"),
        })
    })?;
    let manager = PostgresConnectionManager::new(options, Duration::from_secs(30));
    run_postgres_migrations(&manager).await?;
    manager.disconnect().await;
    Ok(())
}
