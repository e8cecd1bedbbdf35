use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::error::Error;
use crate::quota::SubjectKind;

#[cfg(any(test, feature = "e2e_tests"))]
pub mod fake_quota_store;
pub mod postgres;

#[cfg(any(test, feature = "e2e_tests"))]
pub use fake_quota_store::FakeQuotaStore;

#[async_trait]
pub trait HealthCheckable {
    async fn health(&self) -> Result<(), Error>;
}

/// A single row of the quota table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub principal_id: String,
    pub subject: SubjectKind,
    pub limit: i64,
    pub available: i64,
    pub updated_at: DateTime<Utc>,
    pub revoked_at: DateTime<Utc>,
}

/// Atomic statements against the quota table.
///
/// Every method is a single statement at the store, so callers never
/// read-modify-write a balance. Implementations make sure they hold a live
/// connection before issuing the statement.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait QuotaQueries: Send + Sync {
    /// Runs the liveness probe against the currently held connection.
    async fn connected(&self) -> bool;

    /// Reconnects if the held connection is missing or dead.
    async fn ensure_connected(&self) -> Result<(), Error>;

    /// Inserts a fresh record with `available = limit`.
    /// Racing initializations are ignored, so this is safe to call more than once.
    async fn init_quota(
        &self,
        principal_id: &str,
        subject: SubjectKind,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<(), Error>;

    /// Returns `None` if the principal was never initialized.
    async fn select_available(
        &self,
        principal_id: &str,
        subject: SubjectKind,
    ) -> Result<Option<i64>, Error>;

    async fn select_record(
        &self,
        principal_id: &str,
        subject: SubjectKind,
    ) -> Result<Option<QuotaRecord>, Error>;

    /// Absolute reset of the balance. Returns the number of affected rows.
    async fn set_available(
        &self,
        limit: i64,
        now: DateTime<Utc>,
        principal_id: &str,
        subject: SubjectKind,
    ) -> Result<u64, Error>;

    /// Relative adjustment (`available = available + delta`), saturating at the `i64` bounds.
    /// Returns the number of affected rows.
    async fn update_available(
        &self,
        delta: i64,
        now: DateTime<Utc>,
        principal_id: &str,
        subject: SubjectKind,
    ) -> Result<u64, Error>;

    /// Resets every record of `subject` whose last revocation happened at or before `revoked_before`.
    async fn revoke_expired(
        &self,
        subject: SubjectKind,
        limit: i64,
        now: DateTime<Utc>,
        revoked_before: DateTime<Utc>,
    ) -> Result<u64, Error>;

    /// Adds `amount` to every record of `subject` whose last revocation happened at or before `revoked_before`.
    async fn increase_expired(
        &self,
        subject: SubjectKind,
        amount: i64,
        now: DateTime<Utc>,
        revoked_before: DateTime<Utc>,
    ) -> Result<u64, Error>;
}

/// Cumulative token counters for one (user, provider, model) triple.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[async_trait]
#[cfg_attr(test, automock)]
pub trait TokenUsageQueries: Send + Sync {
    /// Adds to the counters in one upsert. Counters saturate at `i64::MAX`.
    async fn add_token_usage(
        &self,
        user_id: &str,
        provider: &str,
        model: &str,
        usage: TokenUsage,
        now: DateTime<Utc>,
    ) -> Result<(), Error>;

    async fn get_token_usage(
        &self,
        user_id: &str,
        provider: &str,
        model: &str,
    ) -> Result<Option<TokenUsage>, Error>;
}
