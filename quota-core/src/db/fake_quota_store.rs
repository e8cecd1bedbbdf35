use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{HealthCheckable, QuotaQueries, QuotaRecord, TokenUsage, TokenUsageQueries};
use crate::error::{Error, ErrorDetails};
use crate::quota::SubjectKind;

type QuotaKey = (String, SubjectKind);
type TokenUsageKey = (String, String, String);

/// Token counters are `BIGINT` columns in Postgres.
const MAX_TOKEN_COUNT: u64 = i64::MAX as u64;

/// Simple in-memory implementation of the quota store for testing.
///
/// Every statement takes the write lock for its whole duration, which gives
/// the same atomicity a single SQL statement has. The connection is simulated:
/// it can be dropped (the next statement reconnects) or the whole store can be
/// made unreachable (reconnecting fails with `StorageUnavailable`).
///
/// Clones share the same data.
#[derive(Clone, Debug, Default)]
pub struct FakeQuotaStore {
    quotas: Arc<RwLock<HashMap<QuotaKey, QuotaRecord>>>,
    token_usage: Arc<RwLock<HashMap<TokenUsageKey, TokenUsage>>>,
    connected: Arc<AtomicBool>,
    unreachable: Arc<AtomicBool>,
}

impl FakeQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the server closing our connection.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Makes every future connection attempt fail (or succeed again).
    /// Setting the store unreachable also drops the current connection.
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
        if !reachable {
            self.drop_connection();
        }
    }

    /// Writes a record directly, bypassing the limiter.
    pub async fn insert_record(&self, record: QuotaRecord) {
        self.quotas
            .write()
            .await
            .insert((record.principal_id.clone(), record.subject), record);
    }

    pub async fn records(&self) -> Vec<QuotaRecord> {
        self.quotas.read().await.values().cloned().collect()
    }

    fn check_connected(&self) -> Result<(), Error> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorDetails::StorageUnavailable {
                message: "fake quota store is unreachable".to_string(),
            }));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl HealthCheckable for FakeQuotaStore {
    async fn health(&self) -> Result<(), Error> {
        self.check_connected()
    }
}

#[async_trait]
impl QuotaQueries for FakeQuotaStore {
    async fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.unreachable.load(Ordering::SeqCst)
    }

    async fn ensure_connected(&self) -> Result<(), Error> {
        self.check_connected()
    }

    async fn init_quota(
        &self,
        principal_id: &str,
        subject: SubjectKind,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.check_connected()?;
        self.quotas
            .write()
            .await
            .entry((principal_id.to_string(), subject))
            .or_insert_with(|| QuotaRecord {
                principal_id: principal_id.to_string(),
                subject,
                limit,
                available: limit,
                updated_at: now,
                revoked_at: now,
            });
        Ok(())
    }

    async fn select_available(
        &self,
        principal_id: &str,
        subject: SubjectKind,
    ) -> Result<Option<i64>, Error> {
        self.check_connected()?;
        Ok(self
            .quotas
            .read()
            .await
            .get(&(principal_id.to_string(), subject))
            .map(|record| record.available))
    }

    async fn select_record(
        &self,
        principal_id: &str,
        subject: SubjectKind,
    ) -> Result<Option<QuotaRecord>, Error> {
        self.check_connected()?;
        Ok(self
            .quotas
            .read()
            .await
            .get(&(principal_id.to_string(), subject))
            .cloned())
    }

    async fn set_available(
        &self,
        limit: i64,
        now: DateTime<Utc>,
        principal_id: &str,
        subject: SubjectKind,
    ) -> Result<u64, Error> {
        self.check_connected()?;
        let mut quotas = self.quotas.write().await;
        let Some(record) = quotas.get_mut(&(principal_id.to_string(), subject)) else {
            return Ok(0);
        };
        record.limit = limit;
        record.available = limit;
        record.updated_at = now;
        record.revoked_at = now;
        Ok(1)
    }

    async fn update_available(
        &self,
        delta: i64,
        now: DateTime<Utc>,
        principal_id: &str,
        subject: SubjectKind,
    ) -> Result<u64, Error> {
        self.check_connected()?;
        let mut quotas = self.quotas.write().await;
        let Some(record) = quotas.get_mut(&(principal_id.to_string(), subject)) else {
            return Ok(0);
        };
        record.available = record.available.saturating_add(delta);
        record.updated_at = now;
        Ok(1)
    }

    async fn revoke_expired(
        &self,
        subject: SubjectKind,
        limit: i64,
        now: DateTime<Utc>,
        revoked_before: DateTime<Utc>,
    ) -> Result<u64, Error> {
        self.check_connected()?;
        let mut revoked = 0;
        for record in self.quotas.write().await.values_mut() {
            if record.subject == subject && record.revoked_at <= revoked_before {
                record.limit = limit;
                record.available = limit;
                record.updated_at = now;
                record.revoked_at = now;
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn increase_expired(
        &self,
        subject: SubjectKind,
        amount: i64,
        now: DateTime<Utc>,
        revoked_before: DateTime<Utc>,
    ) -> Result<u64, Error> {
        self.check_connected()?;
        let mut increased = 0;
        for record in self.quotas.write().await.values_mut() {
            if record.subject == subject && record.revoked_at <= revoked_before {
                record.available = record.available.saturating_add(amount);
                record.updated_at = now;
                record.revoked_at = now;
                increased += 1;
            }
        }
        Ok(increased)
    }
}

#[async_trait]
impl TokenUsageQueries for FakeQuotaStore {
    async fn add_token_usage(
        &self,
        user_id: &str,
        provider: &str,
        model: &str,
        usage: TokenUsage,
        _now: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.check_connected()?;
        let mut token_usage = self.token_usage.write().await;
        let entry = token_usage
            .entry((user_id.to_string(), provider.to_string(), model.to_string()))
            .or_default();
        entry.input_tokens = entry
            .input_tokens
            .saturating_add(usage.input_tokens)
            .min(MAX_TOKEN_COUNT);
        entry.output_tokens = entry
            .output_tokens
            .saturating_add(usage.output_tokens)
            .min(MAX_TOKEN_COUNT);
        Ok(())
    }

    async fn get_token_usage(
        &self,
        user_id: &str,
        provider: &str,
        model: &str,
    ) -> Result<Option<TokenUsage>, Error> {
        self.check_connected()?;
        Ok(self
            .token_usage
            .read()
            .await
            .get(&(user_id.to_string(), provider.to_string(), model.to_string()))
            .cloned())
    }
}
