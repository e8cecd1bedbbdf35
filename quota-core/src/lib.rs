//! Per-user and cluster-wide token quota accounting backed by PostgreSQL.
//!
//! A [`quota::QuotaLimiter`] holds one balance per subject in the `quota_limits`
//! table. Requests are checked with `ensure_available_quota` before they run and
//! charged with `consume_tokens` afterwards. The [`scheduler::QuotaScheduler`]
//! periodically resets or tops up balances whose period has elapsed.

pub mod config;
pub mod db;
pub mod error;
pub mod observability;
pub mod quota;
pub mod scheduler;
