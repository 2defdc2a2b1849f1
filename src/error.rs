//! Crate-level error surface.
//!
//! Each capability module owns its error enum; this module classifies
//! them. `ErrorCode` is the stable wire taxonomy, `Transience` says
//! whether a retry can help. Every response-path error carries a
//! correlation id linking the coordinator log, the WAL record (if one
//! was appended) and the applier log.

use serde::Serialize;
use thiserror::Error;

use crate::core::CorrelationId;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Stable error codes exposed to clients.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    ValidationError,
    Forbidden,
    NotFound,
    Conflict,
    ServiceUnavailable,
    Timeout,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Crate-level convenience error: a thin wrapper over the capability
/// errors, not a replacement for them.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Coord(#[from] crate::coord::CoordError),

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    #[error(transparent)]
    Wal(#[from] crate::wal::WalError),

    #[error(transparent)]
    Schema(#[from] crate::schema::RegistryError),

    #[error(transparent)]
    Apply(#[from] crate::apply::ApplyError),

    #[error(transparent)]
    Archive(#[from] crate::archive::ArchiveError),

    #[error(transparent)]
    Snapshot(#[from] crate::snapshot::SnapshotError),

    #[error(transparent)]
    Recovery(#[from] crate::recovery::RecoveryError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Coord(e) => e.code(),
            Error::Store(e) => match e {
                crate::store::StoreError::NotFound { .. } => ErrorCode::NotFound,
                crate::store::StoreError::Forbidden { .. } => ErrorCode::Forbidden,
                crate::store::StoreError::InvalidId(_) => ErrorCode::InvalidRequest,
                _ => ErrorCode::Internal,
            },
            Error::Wal(e) => match e.transience() {
                Transience::Retryable => ErrorCode::ServiceUnavailable,
                _ => ErrorCode::Internal,
            },
            Error::Schema(_) | Error::Config(_) => ErrorCode::InvalidRequest,
            Error::Apply(_) | Error::Archive(_) | Error::Snapshot(_) | Error::Recovery(_) => {
                ErrorCode::Internal
            }
        }
    }

    pub fn transience(&self) -> Transience {
        match self {
            Error::Coord(e) => e.transience(),
            Error::Store(e) => e.transience(),
            Error::Wal(e) => e.transience(),
            Error::Schema(_) | Error::Config(_) => Transience::Permanent,
            Error::Apply(e) => e.transience(),
            Error::Archive(e) => e.transience(),
            Error::Snapshot(e) => e.transience(),
            Error::Recovery(e) => e.transience(),
        }
    }
}

/// Wire shape of an error: code, message, details, correlation id.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
    pub correlation_id: CorrelationId,
}

impl ErrorPayload {
    pub fn from_error(err: &Error, correlation_id: CorrelationId) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            details: err.details(),
            correlation_id,
        }
    }
}

impl Error {
    fn details(&self) -> serde_json::Value {
        match self {
            Error::Coord(crate::coord::CoordError::Validation { errors }) => {
                serde_json::to_value(errors).unwrap_or_default()
            }
            _ => serde_json::Value::Null,
        }
    }
}
