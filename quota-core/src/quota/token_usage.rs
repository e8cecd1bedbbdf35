use std::sync::Arc;

use chrono::Utc;

use crate::db::{TokenUsage, TokenUsageQueries};
use crate::error::Error;

/// Cumulative token counters per (user, provider, model).
///
/// Unlike quota balances these are never reset; they record what was used.
#[derive(Clone)]
pub struct TokenUsageHistory {
    store: Arc<dyn TokenUsageQueries>,
}

impl std::fmt::Debug for TokenUsageHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenUsageHistory")
            .field("store", &"<dyn TokenUsageQueries>")
            .finish()
    }
}

impl TokenUsageHistory {
    pub fn new(store: Arc<dyn TokenUsageQueries>) -> Self {
        Self { store }
    }

    #[tracing::instrument(skip(self))]
    pub async fn consume_tokens(
        &self,
        user_id: &str,
        provider: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<(), Error> {
        self.store
            .add_token_usage(
                user_id,
                provider,
                model,
                TokenUsage {
                    input_tokens,
                    output_tokens,
                },
                Utc::now(),
            )
            .await
    }

    /// Returns zero counters for a triple that never consumed anything.
    pub async fn usage(&self, user_id: &str, provider: &str, model: &str) -> Result<TokenUsage, Error> {
        Ok(self
            .store
            .get_token_usage(user_id, provider, model)
            .await?
            .unwrap_or_default())
    }
}
