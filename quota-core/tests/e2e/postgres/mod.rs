mod quota_queries;
mod token_usage_queries;

use std::sync::Arc;
use std::time::Duration;

use quota_core::db::postgres::{
    PostgresConnectionManager, PostgresQuotaStore, manual_run_postgres_migrations_with_url,
};
use sqlx::ConnectOptions;
use sqlx::postgres::PgConnectOptions;

/// Migrates the per-test database and returns a store holding its own connection.
pub async fn setup_store(conn_opts: PgConnectOptions) -> PostgresQuotaStore {
    manual_run_postgres_migrations_with_url(conn_opts.to_url_lossy().as_ref())
        .await
        .unwrap();
    let manager = PostgresConnectionManager::new(conn_opts, Duration::from_secs(5));
    PostgresQuotaStore::new(Arc::new(manager))
}
