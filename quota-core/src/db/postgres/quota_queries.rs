use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use super::PostgresConnectionManager;
use crate::db::{HealthCheckable, QuotaQueries, QuotaRecord};
use crate::error::Error;
use crate::quota::SubjectKind;

/// Quota statements backed by a single managed Postgres connection.
#[derive(Clone, Debug)]
pub struct PostgresQuotaStore {
    manager: Arc<PostgresConnectionManager>,
}

impl PostgresQuotaStore {
    pub fn new(manager: Arc<PostgresConnectionManager>) -> Self {
        Self { manager }
    }

    pub fn connection_manager(&self) -> &PostgresConnectionManager {
        &self.manager
    }

    /// Drops the held connection. Used on shutdown.
    pub async fn disconnect(&self) {
        self.manager.disconnect().await;
    }
}

#[async_trait]
impl HealthCheckable for PostgresQuotaStore {
    async fn health(&self) -> Result<(), Error> {
        let mut guard = self.manager.acquire().await?;
        let result = sqlx::query("SELECT 1")
            .execute(guard.connection()?)
            .await;
        guard.check(result)?;
        Ok(())
    }
}

#[async_trait]
impl QuotaQueries for PostgresQuotaStore {
    async fn connected(&self) -> bool {
        self.manager.connected().await
    }

    async fn ensure_connected(&self) -> Result<(), Error> {
        self.manager.ensure_connected().await
    }

    async fn init_quota(
        &self,
        principal_id: &str,
        subject: SubjectKind,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut guard = self.manager.acquire().await?;
        let result = sqlx::query(
            r"
            INSERT INTO quota_limits (id, subject, quota_limit, available, updated_at, revoked_at)
            VALUES ($1, $2, $3, $3, $4, $4)
            ON CONFLICT (id, subject) DO NOTHING
            ",
        )
        .bind(principal_id)
        .bind(subject.as_db_str())
        .bind(limit)
        .bind(now)
        .execute(guard.connection()?)
        .await;
        guard.check(result)?;
        Ok(())
    }

    async fn select_available(
        &self,
        principal_id: &str,
        subject: SubjectKind,
    ) -> Result<Option<i64>, Error> {
        let mut guard = self.manager.acquire().await?;
        let result = sqlx::query_scalar::<_, i64>(
            "SELECT available FROM quota_limits WHERE id = $1 AND subject = $2",
        )
        .bind(principal_id)
        .bind(subject.as_db_str())
        .fetch_optional(guard.connection()?)
        .await;
        guard.check(result)
    }

    async fn select_record(
        &self,
        principal_id: &str,
        subject: SubjectKind,
    ) -> Result<Option<QuotaRecord>, Error> {
        let mut guard = self.manager.acquire().await?;
        let result = sqlx::query(
            r"
            SELECT quota_limit, available, updated_at, revoked_at
            FROM quota_limits
            WHERE id = $1 AND subject = $2
            ",
        )
        .bind(principal_id)
        .bind(subject.as_db_str())
        .fetch_optional(guard.connection()?)
        .await;
        let Some(row) = guard.check(result)? else {
            return Ok(None);
        };
        Ok(Some(QuotaRecord {
            principal_id: principal_id.to_string(),
            subject,
            limit: row.try_get("quota_limit")?,
            available: row.try_get("available")?,
            updated_at: row.try_get("updated_at")?,
            revoked_at: row.try_get("revoked_at")?,
        }))
    }

    async fn set_available(
        &self,
        limit: i64,
        now: DateTime<Utc>,
        principal_id: &str,
        subject: SubjectKind,
    ) -> Result<u64, Error> {
        let mut guard = self.manager.acquire().await?;
        let result = sqlx::query(
            r"
            UPDATE quota_limits
            SET available = $1, quota_limit = $1, updated_at = $2, revoked_at = $2
            WHERE id = $3 AND subject = $4
            ",
        )
        .bind(limit)
        .bind(now)
        .bind(principal_id)
        .bind(subject.as_db_str())
        .execute(guard.connection()?)
        .await;
        Ok(guard.check(result)?.rows_affected())
    }

    async fn update_available(
        &self,
        delta: i64,
        now: DateTime<Utc>,
        principal_id: &str,
        subject: SubjectKind,
    ) -> Result<u64, Error> {
        let mut guard = self.manager.acquire().await?;
        let result = sqlx::query(
            r"
            UPDATE quota_limits
            SET available = GREATEST(LEAST(available::NUMERIC + $1, 9223372036854775807), -9223372036854775808)::BIGINT,
                updated_at = $2
            WHERE id = $3 AND subject = $4
            ",
        )
        .bind(delta)
        .bind(now)
        .bind(principal_id)
        .bind(subject.as_db_str())
        .execute(guard.connection()?)
        .await;
        Ok(guard.check(result)?.rows_affected())
    }

    async fn revoke_expired(
        &self,
        subject: SubjectKind,
        limit: i64,
        now: DateTime<Utc>,
        revoked_before: DateTime<Utc>,
    ) -> Result<u64, Error> {
        let mut guard = self.manager.acquire().await?;
        let result = sqlx::query(
            r"
            UPDATE quota_limits
            SET available = $1, quota_limit = $1, updated_at = $2, revoked_at = $2
            WHERE subject = $3 AND revoked_at <= $4
            ",
        )
        .bind(limit)
        .bind(now)
        .bind(subject.as_db_str())
        .bind(revoked_before)
        .execute(guard.connection()?)
        .await;
        Ok(guard.check(result)?.rows_affected())
    }

    async fn increase_expired(
        &self,
        subject: SubjectKind,
        amount: i64,
        now: DateTime<Utc>,
        revoked_before: DateTime<Utc>,
    ) -> Result<u64, Error> {
        let mut guard = self.manager.acquire().await?;
        let result = sqlx::query(
            r"
            UPDATE quota_limits
            SET available = GREATEST(LEAST(available::NUMERIC + $1, 9223372036854775807), -9223372036854775808)::BIGINT,
                updated_at = $2,
                revoked_at = $2
            WHERE subject = $3 AND revoked_at <= $4
            ",
        )
        .bind(amount)
        .bind(now)
        .bind(subject.as_db_str())
        .bind(revoked_before)
        .execute(guard.connection()?)
        .await;
        Ok(guard.check(result)?.rows_affected())
    }
}
