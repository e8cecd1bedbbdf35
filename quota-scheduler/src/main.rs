use std::fmt::Display;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use quota_core::config::QuotaConfig;
use quota_core::db::postgres::{run_postgres_migrations, PostgresConnectionManager, PostgresQuotaStore};
use quota_core::db::HealthCheckable;
use quota_core::observability;
use quota_core::scheduler::QuotaScheduler;

mod cli;
use cli::Args;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    observability::setup_logs(args.log_format).expect_pretty("Failed to set up logs");

    let config = QuotaConfig::load_from_path(&args.config_file)
        .ok() // Don't print the error here, since it was already printed when it was constructed
        .expect_pretty(&format!(
            "Failed to load config file `{}`",
            args.config_file.display()
        ));

    let manager = PostgresConnectionManager::connect(&config.storage)
        .await
        .expect_pretty("Failed to connect to Postgres");
    run_postgres_migrations(&manager)
        .await
        .expect_pretty("Failed to run Postgres migrations");
    if args.run_migrations_only {
        tracing::info!("Postgres migrations completed");
        manager.disconnect().await;
        return;
    }

    let store = Arc::new(PostgresQuotaStore::new(Arc::new(manager)));
    store
        .health()
        .await
        .expect_pretty("Postgres liveness probe failed");

    let scheduler =
        QuotaScheduler::from_config(&config, store.clone()).expect_pretty("Invalid limiter config");
    tracing::info!(
        "Starting quota scheduler with {} limiter(s), running every {}",
        scheduler.limiters().len(),
        config.scheduler.period
    );

    let token = CancellationToken::new();
    let handle = scheduler.spawn(token.clone());

    shutdown_signal().await;
    token.cancel();
    if let Err(e) = handle.await {
        tracing::error!("Quota scheduler task failed: {e}");
    }
    store.disconnect().await;
    tracing::info!("Quota scheduler shut down");
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect_pretty("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect_pretty("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    #[cfg(unix)]
    let hangup = async {
        signal::unix::signal(signal::unix::SignalKind::hangup())
            .expect_pretty("Failed to install SIGHUP handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let hangup = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM signal");
        }
        () = hangup => {
            tracing::info!("Received SIGHUP signal");
        }
    };
}

/// Logs the error and exits, for failures that leave nothing to run.
trait ExpectPretty<T> {
    fn expect_pretty(self, msg: &str) -> T;
}

impl<T, E: Display> ExpectPretty<T> for Result<T, E> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::error!("{msg}: {err}");
                std::process::exit(1);
            }
        }
    }
}

impl<T> ExpectPretty<T> for Option<T> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Some(value) => value,
            None => {
                tracing::error!("{msg}");
                std::process::exit(1);
            }
        }
    }
}
