//! Configuration for the quota service, loaded from a TOML file.
//!
//! ```toml
//! [storage]
//! host = "localhost"
//! dbname = "quota"
//! user = "postgres"
//! password_path = "/var/secrets/pg-password"
//!
//! [scheduler]
//! period = "5 minutes"
//!
//! [[limiters]]
//! name = "user_monthly"
//! type = "user_limiter"
//! initial_quota = 100000
//! quota_increase = 1000
//! period = "30 days"
//! ```
//!
//! Setting `QUOTA_POSTGRES_URL` replaces the whole `[storage]` connection section.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use sqlx::postgres::{PgConnectOptions, PgSslMode};

use crate::error::{Error, ErrorDetails};
use crate::quota::SubjectKind;

mod period;

pub use period::{PeriodUnit, QuotaPeriod};

pub const POSTGRES_URL_ENV_VAR: &str = "QUOTA_POSTGRES_URL";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaConfig {
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub limiters: Vec<LimiterConfig>,
    #[serde(default)]
    pub token_history: TokenHistoryConfig,
}

impl QuotaConfig {
    pub fn load_from_path(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file `{}`: {e}", path.display()),
            })
        })?;
        let mut config = Self::parse(&contents)?;
        if let Ok(url) = std::env::var(POSTGRES_URL_ENV_VAR) {
            tracing::info!("Using `{POSTGRES_URL_ENV_VAR}` for the quota storage connection");
            config.storage.url = Some(SecretString::from(url));
        }
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, Error> {
        let config: QuotaConfig = toml::from_str(contents).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse quota config: {e}"),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        let mut names = HashSet::new();
        for limiter in &self.limiters {
            if !names.insert(limiter.name.as_str()) {
                return Err(Error::new(ErrorDetails::Config {
                    message: format!("Duplicate quota limiter name `{}`", limiter.name),
                }));
            }
            if i64::try_from(limiter.initial_quota).is_err() {
                return Err(Error::new(ErrorDetails::Config {
                    message: format!(
                        "`initial_quota` of limiter `{}` is too large",
                        limiter.name
                    ),
                }));
            }
        }
        if self.storage.password.is_some() && self.storage.password_path.is_some() {
            return Err(Error::new(ErrorDetails::Config {
                message: "`storage.password` and `storage.password_path` are mutually exclusive"
                    .to_string(),
            }));
        }
        PgSslMode::from_str(&self.storage.ssl_mode).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Invalid `storage.ssl_mode`: {e}"),
            })
        })?;
        Ok(())
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Full connection URL. Takes precedence over every other connection field.
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub url: Option<SecretString>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_dbname")]
    pub dbname: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub password: Option<SecretString>,
    /// File holding the password, e.g. a mounted secret.
    #[serde(default)]
    pub password_path: Option<PathBuf>,
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    #[serde(default = "default_connect_timeout_s")]
    pub connect_timeout_s: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_dbname() -> String {
    "postgres".to_string()
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_ssl_mode() -> String {
    "prefer".to_string()
}

fn default_connect_timeout_s() -> u64 {
    30
}

impl StorageConfig {
    pub fn connect_options(&self) -> Result<PgConnectOptions, Error> {
        if let Some(url) = &self.url {
            return PgConnectOptions::from_str(url.expose_secret()).map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Invalid Postgres URL: {e}"),
                })
            });
        }
        let ssl_mode = PgSslMode::from_str(&self.ssl_mode).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Invalid `storage.ssl_mode`: {e}"),
            })
        })?;
        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .database(&self.dbname)
            .ssl_mode(ssl_mode);
        if let Some(password) = self.read_password()? {
            options = options.password(password.expose_secret());
        }
        if let Some(ca_cert_path) = &self.ca_cert_path {
            options = options.ssl_root_cert(ca_cert_path);
        }
        Ok(options)
    }

    fn read_password(&self) -> Result<Option<SecretString>, Error> {
        if let Some(password) = &self.password {
            return Ok(Some(SecretString::from(password.expose_secret())));
        }
        let Some(path) = &self.password_path else {
            return Ok(None);
        };
        let password = std::fs::read_to_string(path).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read Postgres password from `{}`: {e}", path.display()),
            })
        })?;
        Ok(Some(SecretString::from(password.trim_end().to_string())))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    /// How often the revocation scheduler wakes up.
    #[serde(default = "default_scheduler_period")]
    pub period: QuotaPeriod,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            period: default_scheduler_period(),
        }
    }
}

fn default_scheduler_period() -> QuotaPeriod {
    QuotaPeriod::FIVE_MINUTES
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterType {
    UserLimiter,
    ClusterLimiter,
}

impl From<LimiterType> for SubjectKind {
    fn from(limiter_type: LimiterType) -> Self {
        match limiter_type {
            LimiterType::UserLimiter => SubjectKind::User,
            LimiterType::ClusterLimiter => SubjectKind::Cluster,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LimiterConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub limiter_type: LimiterType,
    pub initial_quota: u64,
    /// Amount added by `increase_quota`. When set, the scheduler grants this
    /// amount every period instead of resetting the balance.
    #[serde(default)]
    pub quota_increase: Option<u64>,
    /// How long a balance lives before the scheduler revokes it.
    pub period: QuotaPeriod,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TokenHistoryConfig {
    #[serde(default)]
    pub enabled: bool,
}
