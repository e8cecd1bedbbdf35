use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use super::PostgresQuotaStore;
use crate::db::{TokenUsage, TokenUsageQueries};
use crate::error::Error;

/// Token counts are stored as `BIGINT`; larger counts saturate.
fn to_bigint(tokens: u64) -> i64 {
    i64::try_from(tokens).unwrap_or(i64::MAX)
}

/// Counters only ever grow from zero, so a negative value cannot be stored.
fn from_bigint(tokens: i64) -> u64 {
    u64::try_from(tokens).unwrap_or_default()
}

#[async_trait]
impl TokenUsageQueries for PostgresQuotaStore {
    async fn add_token_usage(
        &self,
        user_id: &str,
        provider: &str,
        model: &str,
        usage: TokenUsage,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut guard = self.connection_manager().acquire().await?;
        let result = sqlx::query(
            r"
            INSERT INTO token_usage (user_id, provider, model, input_tokens, output_tokens, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, provider, model) DO UPDATE
            SET input_tokens = LEAST(token_usage.input_tokens::NUMERIC + EXCLUDED.input_tokens, 9223372036854775807)::BIGINT,
                output_tokens = LEAST(token_usage.output_tokens::NUMERIC + EXCLUDED.output_tokens, 9223372036854775807)::BIGINT,
                updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(user_id)
        .bind(provider)
        .bind(model)
        .bind(to_bigint(usage.input_tokens))
        .bind(to_bigint(usage.output_tokens))
        .bind(now)
        .execute(guard.connection()?)
        .await;
        guard.check(result)?;
        Ok(())
    }

    async fn get_token_usage(
        &self,
        user_id: &str,
        provider: &str,
        model: &str,
    ) -> Result<Option<TokenUsage>, Error> {
        let mut guard = self.connection_manager().acquire().await?;
        let result = sqlx::query(
            r"
            SELECT input_tokens, output_tokens
            FROM token_usage
            WHERE user_id = $1 AND provider = $2 AND model = $3
            ",
        )
        .bind(user_id)
        .bind(provider)
        .bind(model)
        .fetch_optional(guard.connection()?)
        .await;
        let Some(row) = guard.check(result)? else {
            return Ok(None);
        };
        Ok(Some(TokenUsage {
            input_tokens: from_bigint(row.try_get("input_tokens")?),
            output_tokens: from_bigint(row.try_get("output_tokens")?),
        }))
    }
}
