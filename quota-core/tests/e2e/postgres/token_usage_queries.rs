//! E2E tests for the token usage history queries.

use std::sync::Arc;

use quota_core::db::TokenUsage;
use quota_core::quota::TokenUsageHistory;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

use super::setup_store;

#[sqlx::test]
async fn test_token_usage_accumulates_per_model(
    _pool_opts: PgPoolOptions,
    conn_opts: PgConnectOptions,
) {
    let history = TokenUsageHistory::new(Arc::new(setup_store(conn_opts).await));

    history
        .consume_tokens("alice", "openai", "gpt-4o", 10, 20)
        .await
        .unwrap();
    history
        .consume_tokens("alice", "openai", "gpt-4o", 5, 5)
        .await
        .unwrap();
    history
        .consume_tokens("alice", "watsonx", "granite", 1, 1)
        .await
        .unwrap();

    assert_eq!(
        history.usage("alice", "openai", "gpt-4o").await.unwrap(),
        TokenUsage {
            input_tokens: 15,
            output_tokens: 25,
        }
    );
    assert_eq!(
        history.usage("alice", "watsonx", "granite").await.unwrap(),
        TokenUsage {
            input_tokens: 1,
            output_tokens: 1,
        }
    );
    assert_eq!(
        history.usage("bob", "openai", "gpt-4o").await.unwrap(),
        TokenUsage::default()
    );
}

#[sqlx::test]
async fn test_token_usage_saturates_instead_of_wrapping(
    _pool_opts: PgPoolOptions,
    conn_opts: PgConnectOptions,
) {
    let history = TokenUsageHistory::new(Arc::new(setup_store(conn_opts).await));

    history
        .consume_tokens("alice", "openai", "gpt-4o", u64::MAX, 3)
        .await
        .unwrap();
    history
        .consume_tokens("alice", "openai", "gpt-4o", 1, 3)
        .await
        .unwrap();

    assert_eq!(
        history.usage("alice", "openai", "gpt-4o").await.unwrap(),
        TokenUsage {
            input_tokens: i64::MAX as u64,
            output_tokens: 6,
        }
    );
}
