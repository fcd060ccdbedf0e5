//! Error types for QuantDB
//!
//! All failures cross the public surface as structured values; nothing in the
//! crate panics on a caller-visible path. Partial results carry the exact
//! sub-windows that are still missing so callers can decide whether to retry.

use chrono::NaiveDate;
use thiserror::Error;

/// Classification of an upstream provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum UpstreamErrorKind {
    RateLimited,
    NotFound,
    Network,
    SchemaChanged,
    Auth,
}

impl UpstreamErrorKind {
    /// Whether the engine may retry a call that failed with this kind.
    pub fn retryable(self) -> bool {
        matches!(self, UpstreamErrorKind::RateLimited | UpstreamErrorKind::Network)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UpstreamErrorKind::RateLimited => "rate_limited",
            UpstreamErrorKind::NotFound => "not_found",
            UpstreamErrorKind::Network => "network_error",
            UpstreamErrorKind::SchemaChanged => "schema_changed",
            UpstreamErrorKind::Auth => "auth_error",
        }
    }
}

/// A contiguous inclusive date range that could not be served.
pub type MissingRange = (NaiveDate, NaiveDate);

/// Main error type for QuantDB
#[derive(Error, Debug)]
pub enum QdbError {
    #[error("Unrecognized symbol: {0}")]
    UnrecognizedSymbol(String),

    #[error("Unknown market: {0}")]
    UnknownMarket(String),

    #[error("Invalid date range: {0}")]
    InvalidDateRange(String),

    #[error("Invalid adjust mode: {0}")]
    InvalidAdjustMode(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Data unavailable: {0}")]
    Unavailable(String),

    #[error("Trading calendar unavailable: {0}")]
    CalendarUnavailable(String),

    #[error("Trading calendar inconsistency: {0}")]
    CalendarInconsistency(String),

    #[error("Upstream error ({}): {message}", kind.as_str())]
    Upstream {
        kind: UpstreamErrorKind,
        message: String,
        retryable: bool,
    },

    #[error("Partial data: {missing_ranges:?} missing ({cause})")]
    PartialData {
        missing_ranges: Vec<MissingRange>,
        cause: String,
    },

    #[error("Deadline expired with {missing_ranges:?} missing")]
    Timeout { missing_ranges: Vec<MissingRange> },

    #[error("Request canceled")]
    Canceled,

    #[error("Upstream queue full, request rejected")]
    Overloaded,

    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    #[error("Coverage index corruption: {0}")]
    CoverageCorruption(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl QdbError {
    /// Build an upstream error, deriving retryability from the kind.
    pub fn upstream(kind: UpstreamErrorKind, message: impl Into<String>) -> Self {
        QdbError::Upstream {
            kind,
            message: message.into(),
            retryable: kind.retryable(),
        }
    }

    /// Whether the engine's retry policy may re-attempt the failed call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QdbError::Upstream { retryable: true, .. })
    }

    /// Stable tag for batch results and the stats surface.
    pub fn kind(&self) -> ErrorKind {
        match self {
            QdbError::UnrecognizedSymbol(_) => ErrorKind::UnrecognizedSymbol,
            QdbError::UnknownMarket(_) => ErrorKind::UnknownMarket,
            QdbError::InvalidDateRange(_) => ErrorKind::InvalidDateRange,
            QdbError::InvalidAdjustMode(_) => ErrorKind::InvalidAdjustMode,
            QdbError::Unavailable(_) => ErrorKind::Unavailable,
            QdbError::CalendarUnavailable(_) => ErrorKind::CalendarUnavailable,
            QdbError::CalendarInconsistency(_) => ErrorKind::CalendarInconsistency,
            QdbError::Upstream { .. } => ErrorKind::UpstreamError,
            QdbError::PartialData { .. } => ErrorKind::PartialData,
            QdbError::Timeout { .. } => ErrorKind::Timeout,
            QdbError::Canceled => ErrorKind::Canceled,
            QdbError::Overloaded => ErrorKind::Overloaded,
            QdbError::SchemaViolation(_) => ErrorKind::SchemaViolation,
            QdbError::CoverageCorruption(_) => ErrorKind::CoverageCorruption,
            QdbError::InvalidConfig(_)
            | QdbError::Storage(_)
            | QdbError::Io(_)
            | QdbError::Serde(_) => ErrorKind::Internal,
        }
    }
}

impl From<rusqlite::Error> for QdbError {
    fn from(e: rusqlite::Error) -> Self {
        QdbError::Storage(e.to_string())
    }
}

/// Coarse error classification exposed to embedders (batch maps, stats).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    UnrecognizedSymbol,
    UnknownMarket,
    InvalidDateRange,
    InvalidAdjustMode,
    Unavailable,
    CalendarUnavailable,
    CalendarInconsistency,
    UpstreamError,
    PartialData,
    Timeout,
    Canceled,
    Overloaded,
    SchemaViolation,
    CoverageCorruption,
    Internal,
}

/// Result type alias for QuantDB operations
pub type Result<T> = std::result::Result<T, QdbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(QdbError::upstream(UpstreamErrorKind::RateLimited, "slow down").is_retryable());
        assert!(QdbError::upstream(UpstreamErrorKind::Network, "reset").is_retryable());
        assert!(!QdbError::upstream(UpstreamErrorKind::NotFound, "gone").is_retryable());
        assert!(!QdbError::upstream(UpstreamErrorKind::Auth, "denied").is_retryable());
        assert!(!QdbError::upstream(UpstreamErrorKind::SchemaChanged, "columns moved").is_retryable());
    }

    #[test]
    fn test_error_kind_tags() {
        assert_eq!(QdbError::Canceled.kind(), ErrorKind::Canceled);
        assert_eq!(QdbError::Overloaded.kind(), ErrorKind::Overloaded);
        assert_eq!(
            QdbError::Storage("disk gone".into()).kind(),
            ErrorKind::Internal
        );
    }
}
