//! Per-principal quota accounting.
//!
//! A `QuotaLimiter` tracks one pool of quota per principal for a single
//! `SubjectKind`. Consumption is an accounting write that never fails for
//! business reasons, even when it drives the balance negative. Enforcement
//! happens up front through `ensure_available_quota`, which is the only
//! operation that returns `QuotaExceeded`.
//!
//! Rows are created lazily: any operation that finds a principal missing
//! initializes it to the configured limit first.

use std::fmt::Display;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::QuotaPeriod;
use crate::db::QuotaQueries;
use crate::error::{Error, ErrorDetails, IMPOSSIBLE_ERROR_MESSAGE};

mod limiter_set;
mod token_usage;

pub use limiter_set::QuotaLimiterSet;
pub use token_usage::TokenUsageHistory;

/// Storage id shared by every principal of a cluster-wide pool.
pub const CLUSTER_PRINCIPAL_ID: &str = "";

/// Discriminates independent quota pools that share the same table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    /// One pool per user.
    User,
    /// A single pool for the whole cluster. The principal id is ignored for storage.
    Cluster,
}

impl SubjectKind {
    /// Single-character discriminator stored in the `subject` column.
    pub fn as_db_str(self) -> &'static str {
        match self {
            SubjectKind::User => "u",
            SubjectKind::Cluster => "c",
        }
    }

    /// The id the record is stored under for `principal_id`.
    pub fn storage_id(self, principal_id: &str) -> &str {
        match self {
            SubjectKind::User => principal_id,
            SubjectKind::Cluster => CLUSTER_PRINCIPAL_ID,
        }
    }
}

impl Display for SubjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubjectKind::User => write!(f, "user"),
            SubjectKind::Cluster => write!(f, "cluster"),
        }
    }
}

/// Quota policy for one subject kind, backed by a shared store.
#[derive(Clone)]
pub struct QuotaLimiter {
    name: String,
    subject: SubjectKind,
    limit: i64,
    bonus: i64,
    store: Arc<dyn QuotaQueries>,
}

impl std::fmt::Debug for QuotaLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaLimiter")
            .field("name", &self.name)
            .field("subject", &self.subject)
            .field("limit", &self.limit)
            .field("bonus", &self.bonus)
            .field("store", &"<dyn QuotaQueries>")
            .finish()
    }
}

fn to_signed(amount: u64, what: &str) -> Result<i64, Error> {
    i64::try_from(amount).map_err(|_| {
        Error::new(ErrorDetails::Config {
            message: format!("{what} `{amount}` does not fit into a signed 64-bit balance"),
        })
    })
}

impl QuotaLimiter {
    /// Creates a limiter with no bonus. The name defaults to the subject kind.
    pub fn new(
        subject: SubjectKind,
        limit: u64,
        store: Arc<dyn QuotaQueries>,
    ) -> Result<Self, Error> {
        Ok(Self {
            name: subject.to_string(),
            subject,
            limit: to_signed(limit, "Quota limit")?,
            bonus: 0,
            store,
        })
    }

    /// Sets the amount granted by `increase_quota`.
    pub fn with_bonus(mut self, bonus: u64) -> Result<Self, Error> {
        self.bonus = to_signed(bonus, "Quota increase")?;
        Ok(self)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subject(&self) -> SubjectKind {
        self.subject
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn bonus(&self) -> i64 {
        self.bonus
    }

    /// Whether the underlying store connection is alive right now.
    pub async fn connected(&self) -> bool {
        self.store.connected().await
    }

    /// Returns the remaining balance, initializing the principal if it was never seen.
    /// The balance can be negative.
    #[tracing::instrument(skip(self), fields(limiter = %self.name, subject = %self.subject))]
    pub async fn available_quota(&self, principal_id: &str) -> Result<i64, Error> {
        let storage_id = self.subject.storage_id(principal_id);
        match self.store.select_available(storage_id, self.subject).await? {
            Some(available) => Ok(available),
            None => {
                self.init_quota(storage_id).await?;
                Ok(self.limit)
            }
        }
    }

    /// Resets the balance to the configured limit, regardless of the previous value.
    #[tracing::instrument(skip(self), fields(limiter = %self.name, subject = %self.subject))]
    pub async fn revoke_quota(&self, principal_id: &str) -> Result<(), Error> {
        let storage_id = self.subject.storage_id(principal_id);
        let updated = self
            .store
            .set_available(self.limit, Utc::now(), storage_id, self.subject)
            .await?;
        if updated == 0 {
            // A fresh record already holds the full limit
            self.init_quota(storage_id).await?;
        }
        Ok(())
    }

    /// Grants the configured bonus on top of the current balance.
    #[tracing::instrument(skip(self), fields(limiter = %self.name, subject = %self.subject))]
    pub async fn increase_quota(&self, principal_id: &str) -> Result<(), Error> {
        self.apply_delta(self.subject.storage_id(principal_id), self.bonus)
            .await
    }

    /// Records tokens used by a completed operation. This never rejects usage,
    /// even when it drives the balance below zero.
    #[tracing::instrument(skip(self), fields(limiter = %self.name, subject = %self.subject))]
    pub async fn consume_tokens(
        &self,
        input_tokens: u64,
        output_tokens: u64,
        principal_id: &str,
    ) -> Result<(), Error> {
        let total = input_tokens.saturating_add(output_tokens);
        let total = i64::try_from(total).unwrap_or(i64::MAX);
        self.apply_delta(self.subject.storage_id(principal_id), -total)
            .await
    }

    /// Fails with `QuotaExceeded` when the balance is zero or below.
    #[tracing::instrument(skip(self), fields(limiter = %self.name, subject = %self.subject))]
    pub async fn ensure_available_quota(&self, principal_id: &str) -> Result<(), Error> {
        let available = self.available_quota(principal_id).await?;
        if available <= 0 {
            return Err(Error::new(ErrorDetails::QuotaExceeded {
                principal_id: principal_id.to_string(),
                subject: self.subject,
                available,
            }));
        }
        Ok(())
    }

    /// Resets every principal of this subject whose last revocation is at least `period` old.
    /// Returns the number of revoked principals.
    pub async fn revoke_expired_quotas(&self, period: QuotaPeriod) -> Result<u64, Error> {
        let now = Utc::now();
        self.store
            .revoke_expired(self.subject, self.limit, now, period.before(now)?)
            .await
    }

    /// Grants the bonus to every principal of this subject whose last revocation is at least `period` old.
    pub async fn increase_expired_quotas(&self, period: QuotaPeriod) -> Result<u64, Error> {
        let now = Utc::now();
        self.store
            .increase_expired(self.subject, self.bonus, now, period.before(now)?)
            .await
    }

    async fn init_quota(&self, storage_id: &str) -> Result<(), Error> {
        tracing::debug!("Initializing quota record");
        self.store
            .init_quota(storage_id, self.subject, self.limit, Utc::now())
            .await
    }

    /// Applies a relative change. A record that does not exist yet is
    /// initialized first, then the change is applied on top of it.
    async fn apply_delta(&self, storage_id: &str, delta: i64) -> Result<(), Error> {
        let updated = self
            .store
            .update_available(delta, Utc::now(), storage_id, self.subject)
            .await?;
        if updated > 0 {
            return Ok(());
        }
        self.init_quota(storage_id).await?;
        let updated = self
            .store
            .update_available(delta, Utc::now(), storage_id, self.subject)
            .await?;
        if updated == 0 {
            return Err(Error::new(ErrorDetails::InternalError {
                message: format!(
                    "Quota record for {} `{storage_id}` vanished right after initialization. {IMPOSSIBLE_ERROR_MESSAGE}",
                    self.subject
                ),
            }));
        }
        Ok(())
    }
}
