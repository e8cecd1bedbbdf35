//! CLI argument definitions for the quota scheduler.

use std::path::PathBuf;

use clap::Parser;
use quota_core::observability::LogFormat;

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Args {
    /// Path to the quota configuration file.
    #[arg(long)]
    pub config_file: PathBuf,

    /// Sets the log format used for all scheduler logs.
    #[arg(long)]
    #[arg(value_enum)]
    #[clap(default_value_t = LogFormat::default())]
    pub log_format: LogFormat,

    /// Create the quota tables then exit.
    #[arg(long)]
    pub run_migrations_only: bool,
}
