use std::sync::Arc;

use futures::future::join_all;

use super::{QuotaLimiter, TokenUsageHistory};
use crate::config::QuotaConfig;
use crate::db::{QuotaQueries, TokenUsageQueries};
use crate::error::Error;

/// All limiters configured for a deployment, consulted together by the request layer.
#[derive(Clone, Debug, Default)]
pub struct QuotaLimiterSet {
    limiters: Vec<QuotaLimiter>,
    token_history: Option<TokenUsageHistory>,
}

impl QuotaLimiterSet {
    pub fn new(limiters: Vec<QuotaLimiter>, token_history: Option<TokenUsageHistory>) -> Self {
        Self {
            limiters,
            token_history,
        }
    }

    /// Builds one limiter per `[[limiters]]` entry, all sharing `store`.
    pub fn from_config<S>(config: &QuotaConfig, store: Arc<S>) -> Result<Self, Error>
    where
        S: QuotaQueries + TokenUsageQueries + 'static,
    {
        let limiters = config
            .limiters
            .iter()
            .map(|limiter| {
                QuotaLimiter::new(
                    limiter.limiter_type.into(),
                    limiter.initial_quota,
                    store.clone(),
                )?
                .with_bonus(limiter.quota_increase.unwrap_or_default())
                .map(|l| l.with_name(&limiter.name))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let token_history = config
            .token_history
            .enabled
            .then(|| TokenUsageHistory::new(store));
        Ok(Self::new(limiters, token_history))
    }

    pub fn limiters(&self) -> &[QuotaLimiter] {
        &self.limiters
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    pub fn token_history(&self) -> Option<&TokenUsageHistory> {
        self.token_history.as_ref()
    }

    /// Fails on the first limiter whose balance is exhausted.
    pub async fn ensure_available_quota(&self, principal_id: &str) -> Result<(), Error> {
        for limiter in &self.limiters {
            limiter.ensure_available_quota(principal_id).await?;
        }
        Ok(())
    }

    /// The smallest balance across all limiters, or `None` if no limiter is configured.
    pub async fn available_quota(&self, principal_id: &str) -> Result<Option<i64>, Error> {
        let mut minimum = None;
        for limiter in &self.limiters {
            let available = limiter.available_quota(principal_id).await?;
            minimum = Some(minimum.map_or(available, |m: i64| m.min(available)));
        }
        Ok(minimum)
    }

    /// Charges every limiter. A failing limiter does not prevent the others from
    /// being charged; the first error is returned afterwards.
    pub async fn consume_tokens(
        &self,
        input_tokens: u64,
        output_tokens: u64,
        principal_id: &str,
    ) -> Result<(), Error> {
        let results = join_all(
            self.limiters
                .iter()
                .map(|limiter| limiter.consume_tokens(input_tokens, output_tokens, principal_id)),
        )
        .await;
        results.into_iter().collect()
    }

    /// Adds the usage to the token history, if it is enabled.
    pub async fn record_token_usage(
        &self,
        principal_id: &str,
        provider: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<(), Error> {
        match &self.token_history {
            Some(history) => {
                history
                    .consume_tokens(principal_id, provider, model, input_tokens, output_tokens)
                    .await
            }
            None => Ok(()),
        }
    }
}
