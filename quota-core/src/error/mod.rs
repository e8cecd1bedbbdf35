use std::fmt::{Debug, Display};
use std::sync::Arc;

use http::StatusCode;
use serde::Serialize;
use thiserror::Error;

use crate::quota::SubjectKind;

pub const IMPOSSIBLE_ERROR_MESSAGE: &str =
    "This should never happen, please file a bug report with the quota service maintainers";

#[derive(Clone, Debug, Error, Serialize)]
#[cfg_attr(test, derive(PartialEq))]
#[error(transparent)]
// As long as the struct member is private, we force people to use the `new` method and log the error.
// We arc `ErrorDetails` per the `clippy::result_large_err` lint, as well as to make it cloneable
pub struct Error(Arc<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Arc::new(details))
    }

    /// Constructs an error without logging it.
    /// Callers that report the error themselves (e.g. at a different level) should use this.
    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Arc::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn log(&self) {
        self.0.log();
    }

    pub fn log_at_level(&self, prefix: &str, level: tracing::Level) {
        self.0.log_at_level(prefix, level);
    }

    pub fn is_retryable(&self) -> bool {
        self.0.is_retryable()
    }

    /// Returns true if this error was caused by the store being unreachable,
    /// either at connect time or in the middle of a statement.
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(*self.0, ErrorDetails::StorageUnavailable { .. })
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(*self.0, ErrorDetails::QuotaExceeded { .. })
    }
}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, Error, Serialize)]
#[cfg_attr(test, derive(PartialEq))]
pub enum ErrorDetails {
    Config {
        message: String,
    },
    InternalError {
        message: String,
    },
    Observability {
        message: String,
    },
    PostgresMigration {
        message: String,
    },
    PostgresQuery {
        message: String,
    },
    QuotaExceeded {
        principal_id: String,
        subject: SubjectKind,
        available: i64,
    },
    StorageUnavailable {
        message: String,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
            ErrorDetails::Observability { .. } => tracing::Level::ERROR,
            ErrorDetails::PostgresMigration { .. } => tracing::Level::ERROR,
            ErrorDetails::PostgresQuery { .. } => tracing::Level::ERROR,
            ErrorDetails::QuotaExceeded { .. } => tracing::Level::WARN,
            ErrorDetails::StorageUnavailable { .. } => tracing::Level::ERROR,
        }
    }

    /// Defines the HTTP status code the request layer should answer with
    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Observability { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::PostgresMigration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::PostgresQuery { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ErrorDetails::StorageUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn log_at_level(&self, prefix: &str, level: tracing::Level) {
        match level {
            tracing::Level::ERROR => tracing::error!("{prefix}{self}"),
            tracing::Level::WARN => tracing::warn!("{prefix}{self}"),
            tracing::Level::INFO => tracing::info!("{prefix}{self}"),
            tracing::Level::DEBUG => tracing::debug!("{prefix}{self}"),
            tracing::Level::TRACE => tracing::trace!("{prefix}{self}"),
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        self.log_at_level("", self.level());
    }

    pub fn is_retryable(&self) -> bool {
        match &self {
            // Retrying will not help until the quota is revoked
            ErrorDetails::QuotaExceeded { .. } => false,
            ErrorDetails::Config { .. } => false,
            ErrorDetails::PostgresMigration { .. } => false,
            _ => true,
        }
    }
}

impl Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::Config { message } => write!(f, "{message}"),
            ErrorDetails::InternalError { message } => {
                write!(f, "Internal error: {message}")
            }
            ErrorDetails::Observability { message } => write!(f, "{message}"),
            ErrorDetails::PostgresMigration { message } => {
                write!(f, "Postgres migration failed: {message}")
            }
            ErrorDetails::PostgresQuery { message } => {
                write!(f, "Postgres query failed: {message}")
            }
            ErrorDetails::QuotaExceeded {
                principal_id,
                subject,
                available,
            } => write!(
                f,
                "Quota exceeded for {subject} `{principal_id}` (available: {available}). Retry after the quota is revoked."
            ),
            ErrorDetails::StorageUnavailable { message } => {
                write!(f, "Quota storage is unavailable: {message}")
            }
        }
    }
}

/// Returns true for failures where the connection itself is gone or unusable,
/// as opposed to a statement that the server rejected.
pub(crate) fn is_connection_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db_err) => db_err
            .code()
            .is_some_and(|code| is_connection_sqlstate(&code)),
        _ => false,
    }
}

/// SQLSTATE class 08 (connection exception) and 57P (the server is shutting
/// down or terminated our backend) leave the session unusable.
fn is_connection_sqlstate(code: &str) -> bool {
    code.starts_with("08") || code.starts_with("57P")
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        if is_connection_error(&err) {
            Self::new(ErrorDetails::StorageUnavailable {
                message: err.to_string(),
            })
        } else {
            Self::new(ErrorDetails::PostgresQuery {
                message: err.to_string(),
            })
        }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::new(ErrorDetails::PostgresMigration {
            message: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_exceeded_is_distinct_from_storage_failure() {
        let quota = Error::new(ErrorDetails::QuotaExceeded {
            principal_id: "alice".to_string(),
            subject: SubjectKind::User,
            available: -10,
        });
        let storage = Error::new(ErrorDetails::StorageUnavailable {
            message: "connection refused".to_string(),
        });

        assert_eq!(quota.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(storage.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(quota.is_quota_exceeded());
        assert!(!quota.is_storage_unavailable());
        assert!(storage.is_storage_unavailable());
        assert!(!quota.is_retryable());
        assert!(storage.is_retryable());
    }

    #[test]
    fn test_quota_exceeded_message_names_principal() {
        let err = Error::new(ErrorDetails::QuotaExceeded {
            principal_id: "alice".to_string(),
            subject: SubjectKind::User,
            available: 0,
        });
        let message = err.to_string();
        assert!(
            message.contains("`alice`"),
            "message should name the principal: {message}"
        );
        assert!(message.contains("user"), "message should name the subject: {message}");
    }

    #[test]
    fn test_sqlx_io_error_maps_to_storage_unavailable() {
        let err: Error = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ))
        .into();
        assert!(err.is_storage_unavailable());

        let err: Error = sqlx::Error::RowNotFound.into();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::PostgresQuery { .. }
        ));
    }

    #[test]
    fn test_connection_sqlstates() {
        assert!(is_connection_sqlstate("57P01"));
        assert!(is_connection_sqlstate("57P02"));
        assert!(is_connection_sqlstate("08006"));
        // query_canceled is a statement failure, the session survives it
        assert!(!is_connection_sqlstate("57014"));
        assert!(!is_connection_sqlstate("23505"));
        assert!(!is_connection_sqlstate("22003"));
    }

    #[test]
    fn test_error_details_serialize() {
        let err = Error::new(ErrorDetails::QuotaExceeded {
            principal_id: "alice".to_string(),
            subject: SubjectKind::Cluster,
            available: 0,
        });
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "QuotaExceeded": {
                    "principal_id": "alice",
                    "subject": "cluster",
                    "available": 0
                }
            })
        );
    }
}
