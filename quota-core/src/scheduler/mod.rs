use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{QuotaConfig, QuotaPeriod};
use crate::db::QuotaQueries;
use crate::error::Error;
use crate::quota::QuotaLimiter;

/// What the scheduler does with a balance once its period has elapsed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpiryAction {
    /// Reset the balance to the limit.
    Revoke,
    /// Add the limiter's bonus on top of the balance.
    Increase,
}

#[derive(Clone, Debug)]
pub struct ScheduledLimiter {
    pub limiter: QuotaLimiter,
    pub period: QuotaPeriod,
    pub action: ExpiryAction,
}

/// Periodically revokes or tops up every balance whose period has elapsed.
#[derive(Debug)]
pub struct QuotaScheduler {
    limiters: Vec<ScheduledLimiter>,
    interval: Duration,
}

impl QuotaScheduler {
    pub fn new(limiters: Vec<ScheduledLimiter>, interval: Duration) -> Self {
        Self { limiters, interval }
    }

    /// Limiters with a `quota_increase` are topped up, the rest are reset.
    pub fn from_config<S: QuotaQueries + 'static>(
        config: &QuotaConfig,
        store: Arc<S>,
    ) -> Result<Self, Error> {
        let limiters = config
            .limiters
            .iter()
            .map(|limiter_config| {
                let limiter = QuotaLimiter::new(
                    limiter_config.limiter_type.into(),
                    limiter_config.initial_quota,
                    store.clone(),
                )?
                .with_bonus(limiter_config.quota_increase.unwrap_or_default())?
                .with_name(&limiter_config.name);
                let action = match limiter_config.quota_increase {
                    Some(_) => ExpiryAction::Increase,
                    None => ExpiryAction::Revoke,
                };
                Ok(ScheduledLimiter {
                    limiter,
                    period: limiter_config.period,
                    action,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(Self::new(limiters, config.scheduler.period.to_std_duration()))
    }

    pub fn limiters(&self) -> &[ScheduledLimiter] {
        &self.limiters
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs every limiter once. A failing limiter is logged and skipped, so one
    /// broken limiter never blocks the others. Returns the number of limiters that failed.
    pub async fn run_cycle(&self) -> usize {
        let mut failures = 0;
        for scheduled in &self.limiters {
            let limiter = &scheduled.limiter;
            if !limiter.connected().await {
                tracing::info!(limiter = limiter.name(), "Quota store connection lost, reconnecting");
            }
            let result = match scheduled.action {
                ExpiryAction::Revoke => limiter.revoke_expired_quotas(scheduled.period).await,
                ExpiryAction::Increase => limiter.increase_expired_quotas(scheduled.period).await,
            };
            match result {
                Ok(updated) => {
                    tracing::info!(
                        limiter = limiter.name(),
                        subject = %limiter.subject(),
                        action = ?scheduled.action,
                        updated,
                        "Processed expired quotas"
                    );
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        limiter = limiter.name(),
                        "Failed to process expired quotas: {e}"
                    );
                }
            }
        }
        failures
    }

    /// Loops until `token` is cancelled. The first cycle runs immediately.
    pub async fn run(self, token: CancellationToken) {
        if self.limiters.is_empty() {
            tracing::warn!("No quota limiters configured, the scheduler has nothing to do");
        }
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = token.cancelled() => {
                    tracing::info!("Quota scheduler stopped");
                    break;
                }
                _ = interval.tick() => {}
            }
            let failures = self.run_cycle().await;
            if failures > 0 {
                tracing::warn!("{failures} quota limiter(s) failed during this cycle");
            }
        }
    }

    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }
}
