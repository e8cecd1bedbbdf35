//! E2E tests for the quota PostgreSQL queries.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use quota_core::db::postgres::{PostgresConnectionManager, PostgresQuotaStore};
use quota_core::db::{HealthCheckable, QuotaQueries};
use quota_core::quota::{QuotaLimiter, SubjectKind};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

use super::setup_store;

async fn backdate_revocation(
    pool: &sqlx::PgPool,
    principal_id: &str,
    subject: SubjectKind,
    revoked_at: DateTime<Utc>,
) {
    sqlx::query("UPDATE quota_limits SET revoked_at = $1 WHERE id = $2 AND subject = $3")
        .bind(revoked_at)
        .bind(principal_id)
        .bind(subject.as_db_str())
        .execute(pool)
        .await
        .unwrap();
}

#[sqlx::test]
async fn test_init_quota_does_not_overwrite(_pool_opts: PgPoolOptions, conn_opts: PgConnectOptions) {
    let store = setup_store(conn_opts).await;
    let now = Utc::now();

    store
        .init_quota("alice", SubjectKind::User, 100, now)
        .await
        .unwrap();
    store
        .update_available(-30, now, "alice", SubjectKind::User)
        .await
        .unwrap();
    store
        .init_quota("alice", SubjectKind::User, 100, now)
        .await
        .unwrap();

    let record = store
        .select_record("alice", SubjectKind::User)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.limit, 100);
    assert_eq!(record.available, 70);
    assert_eq!(
        store
            .select_available("alice", SubjectKind::Cluster)
            .await
            .unwrap(),
        None
    );
}

#[sqlx::test]
async fn test_writes_to_missing_record_affect_nothing(
    _pool_opts: PgPoolOptions,
    conn_opts: PgConnectOptions,
) {
    let store = setup_store(conn_opts).await;
    let now = Utc::now();

    assert_eq!(
        store
            .set_available(10, now, "ghost", SubjectKind::User)
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        store
            .update_available(-1, now, "ghost", SubjectKind::User)
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        store
            .select_available("ghost", SubjectKind::User)
            .await
            .unwrap(),
        None
    );
}

#[sqlx::test]
async fn test_concurrent_consumption_is_not_lost(
    _pool_opts: PgPoolOptions,
    conn_opts: PgConnectOptions,
) {
    let store = Arc::new(setup_store(conn_opts).await);
    let limiter = QuotaLimiter::new(SubjectKind::User, 100, store).unwrap();

    join_all((0..30).map(|_| limiter.consume_tokens(1, 1, "alice")))
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

    assert_eq!(limiter.available_quota("alice").await.unwrap(), 40);
}

#[sqlx::test]
async fn test_alice_scenario(_pool_opts: PgPoolOptions, conn_opts: PgConnectOptions) {
    let store = Arc::new(setup_store(conn_opts).await);
    let user = QuotaLimiter::new(SubjectKind::User, 100, store.clone()).unwrap();
    let cluster = QuotaLimiter::new(SubjectKind::Cluster, 1000, store.clone()).unwrap();

    user.ensure_available_quota("alice").await.unwrap();
    cluster.ensure_available_quota("alice").await.unwrap();
    user.consume_tokens(60, 50, "alice").await.unwrap();
    cluster.consume_tokens(60, 50, "alice").await.unwrap();

    assert_eq!(user.available_quota("alice").await.unwrap(), -10);
    assert_eq!(cluster.available_quota("bob").await.unwrap(), 890);
    let err = user.ensure_available_quota("alice").await.unwrap_err();
    assert!(err.is_quota_exceeded());
    cluster.ensure_available_quota("alice").await.unwrap();

    user.revoke_quota("alice").await.unwrap();
    assert_eq!(user.available_quota("alice").await.unwrap(), 100);
    user.ensure_available_quota("alice").await.unwrap();

    // The cluster pool lives under the empty id
    assert_eq!(
        store
            .select_available("", SubjectKind::Cluster)
            .await
            .unwrap(),
        Some(890)
    );
}

#[sqlx::test]
async fn test_revoke_expired_only_touches_expired_records(
    pool_opts: PgPoolOptions,
    conn_opts: PgConnectOptions,
) {
    let pool = pool_opts.connect_with(conn_opts.clone()).await.unwrap();
    let store = Arc::new(setup_store(conn_opts).await);
    let limiter = QuotaLimiter::new(SubjectKind::User, 100, store.clone()).unwrap();
    let cluster = QuotaLimiter::new(SubjectKind::Cluster, 100, store.clone()).unwrap();

    limiter.consume_tokens(90, 0, "alice").await.unwrap();
    limiter.consume_tokens(90, 0, "bob").await.unwrap();
    cluster.consume_tokens(90, 0, "alice").await.unwrap();
    let two_days_ago = Utc::now() - chrono::Duration::days(2);
    backdate_revocation(&pool, "alice", SubjectKind::User, two_days_ago).await;
    backdate_revocation(&pool, "", SubjectKind::Cluster, two_days_ago).await;

    let revoked = limiter
        .revoke_expired_quotas("1 day".parse().unwrap())
        .await
        .unwrap();

    assert_eq!(revoked, 1);
    assert_eq!(limiter.available_quota("alice").await.unwrap(), 100);
    assert_eq!(limiter.available_quota("bob").await.unwrap(), 10);
    assert_eq!(cluster.available_quota("alice").await.unwrap(), 10);
    let record = store
        .select_record("alice", SubjectKind::User)
        .await
        .unwrap()
        .unwrap();
    assert!(record.revoked_at > two_days_ago);
}

#[sqlx::test]
async fn test_increase_expired_adds_bonus_once_per_period(
    pool_opts: PgPoolOptions,
    conn_opts: PgConnectOptions,
) {
    let pool = pool_opts.connect_with(conn_opts.clone()).await.unwrap();
    let store = Arc::new(setup_store(conn_opts).await);
    let limiter = QuotaLimiter::new(SubjectKind::User, 100, store)
        .unwrap()
        .with_bonus(25)
        .unwrap();

    limiter.consume_tokens(100, 0, "alice").await.unwrap();
    backdate_revocation(&pool, "alice", SubjectKind::User, Utc::now() - chrono::Duration::days(2))
        .await;

    let period = "1 day".parse().unwrap();
    assert_eq!(limiter.increase_expired_quotas(period).await.unwrap(), 1);
    assert_eq!(limiter.increase_expired_quotas(period).await.unwrap(), 0);
    assert_eq!(limiter.available_quota("alice").await.unwrap(), 25);

    limiter.increase_quota("alice").await.unwrap();
    assert_eq!(limiter.available_quota("alice").await.unwrap(), 50);
}

#[sqlx::test]
async fn test_reconnects_after_disconnect(_pool_opts: PgPoolOptions, conn_opts: PgConnectOptions) {
    let store = setup_store(conn_opts).await;
    store.health().await.unwrap();
    assert!(store.connected().await);

    store.disconnect().await;
    assert!(!store.connected().await);

    let limiter = QuotaLimiter::new(SubjectKind::User, 100, Arc::new(store.clone())).unwrap();
    assert_eq!(limiter.available_quota("alice").await.unwrap(), 100);
    assert!(store.connected().await);
}

#[tokio::test]
async fn test_unreachable_store_reports_storage_unavailable() {
    let options = PgConnectOptions::new()
        .host("127.0.0.1")
        .port(1)
        .username("quota")
        .database("quota");
    let store = PostgresQuotaStore::new(Arc::new(PostgresConnectionManager::new(
        options,
        Duration::from_secs(2),
    )));
    let limiter = QuotaLimiter::new(SubjectKind::User, 100, Arc::new(store.clone())).unwrap();

    assert!(!store.connected().await);
    let err = limiter.available_quota("alice").await.unwrap_err();
    assert!(err.is_storage_unavailable(), "{err}");
    let err = store.health().await.unwrap_err();
    assert!(err.is_storage_unavailable(), "{err}");
}

#[sqlx::test]
async fn test_terminated_backend_mid_statement_drops_connection(
    _pool_opts: PgPoolOptions,
    conn_opts: PgConnectOptions,
) {
    let store = setup_store(conn_opts).await;
    let limiter = QuotaLimiter::new(SubjectKind::User, 100, Arc::new(store.clone())).unwrap();
    limiter.consume_tokens(10, 0, "alice").await.unwrap();

    {
        let mut guard = store.connection_manager().acquire().await.unwrap();
        let result = sqlx::query("SELECT pg_terminate_backend(pg_backend_pid())")
            .execute(guard.connection().unwrap())
            .await;
        let err = guard.check(result).unwrap_err();
        assert!(err.is_storage_unavailable(), "{err}");
    }
    assert!(!store.connected().await);

    assert_eq!(limiter.available_quota("alice").await.unwrap(), 90);
    assert!(store.connected().await);
}

#[sqlx::test]
async fn test_reconnects_after_backend_terminated_by_server(
    pool_opts: PgPoolOptions,
    conn_opts: PgConnectOptions,
) {
    let pool = pool_opts.connect_with(conn_opts.clone()).await.unwrap();
    let store = setup_store(conn_opts).await;
    let limiter = QuotaLimiter::new(SubjectKind::User, 100, Arc::new(store.clone())).unwrap();
    limiter.consume_tokens(10, 0, "alice").await.unwrap();

    sqlx::query(
        r"
        SELECT pg_terminate_backend(pid)
        FROM pg_stat_activity
        WHERE datname = current_database() AND pid <> pg_backend_pid()
        ",
    )
    .execute(&pool)
    .await
    .unwrap();

    limiter.consume_tokens(10, 0, "alice").await.unwrap();
    assert_eq!(limiter.available_quota("alice").await.unwrap(), 80);
}

#[sqlx::test]
async fn test_balance_saturates_instead_of_failing(
    _pool_opts: PgPoolOptions,
    conn_opts: PgConnectOptions,
) {
    let store = Arc::new(setup_store(conn_opts).await);
    let limiter = QuotaLimiter::new(SubjectKind::User, 100, store)
        .unwrap()
        .with_bonus(i64::MAX as u64)
        .unwrap();

    limiter.consume_tokens(u64::MAX, 0, "alice").await.unwrap();
    limiter.consume_tokens(u64::MAX, 0, "alice").await.unwrap();
    assert_eq!(limiter.available_quota("alice").await.unwrap(), i64::MIN);

    limiter.revoke_quota("alice").await.unwrap();
    limiter.increase_quota("alice").await.unwrap();
    assert_eq!(limiter.available_quota("alice").await.unwrap(), i64::MAX);
}
