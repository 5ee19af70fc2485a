//! Error taxonomy for the journey engine.

use serde::Serialize;
use thiserror::Error;

use crate::directory::DirectoryError;
use crate::store::StoreError;

/// Engine errors.
///
/// Every variant maps to a machine-readable [`ErrorKind`] that the client
/// layer can switch on without parsing messages.
#[derive(Debug, Error)]
pub enum ConvoyError {
    /// Malformed or out-of-range input. Nothing was changed.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Caller is not the owner, not a group member, or not an admin.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Unknown journey, instance or group.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Double start, double complete, or an invalid state transition.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A collaborator the operation cannot proceed without is degraded.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Authorization did not complete within the configured window.
    #[error("Timed out: {0}")]
    Timeout(String),
}

/// Machine-readable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Forbidden,
    NotFound,
    Conflict,
    Unavailable,
    Timeout,
}

impl ErrorKind {
    /// Stable string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Timeout => "timeout",
        }
    }

    /// Numeric code used in protocol error frames.
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            ErrorKind::Validation => 1001,
            ErrorKind::Forbidden => 1003,
            ErrorKind::NotFound => 1004,
            ErrorKind::Conflict => 1009,
            ErrorKind::Unavailable => 1503,
            ErrorKind::Timeout => 1504,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ConvoyError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConvoyError::Validation(_) => ErrorKind::Validation,
            ConvoyError::Forbidden(_) => ErrorKind::Forbidden,
            ConvoyError::NotFound(_) => ErrorKind::NotFound,
            ConvoyError::Conflict(_) => ErrorKind::Conflict,
            ConvoyError::Unavailable(_) => ErrorKind::Unavailable,
            ConvoyError::Timeout(_) => ErrorKind::Timeout,
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        ConvoyError::Validation(msg.into())
    }

    pub(crate) fn forbidden(msg: impl Into<String>) -> Self {
        ConvoyError::Forbidden(msg.into())
    }

    pub(crate) fn not_found(msg: impl Into<String>) -> Self {
        ConvoyError::NotFound(msg.into())
    }

    pub(crate) fn conflict(msg: impl Into<String>) -> Self {
        ConvoyError::Conflict(msg.into())
    }
}

impl From<StoreError> for ConvoyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(what) => ConvoyError::Conflict(what),
            StoreError::Missing(what) => ConvoyError::NotFound(what),
            StoreError::Backend(msg) => ConvoyError::Unavailable(format!("store: {msg}")),
        }
    }
}

impl From<DirectoryError> for ConvoyError {
    fn from(err: DirectoryError) -> Self {
        ConvoyError::Unavailable(format!("directory: {err}"))
    }
}

/// Result alias used across the engine.
pub type Result<T, E = ConvoyError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(ConvoyError::validation("x").kind(), ErrorKind::Validation);
        assert_eq!(ConvoyError::conflict("x").kind().as_str(), "conflict");
        assert_eq!(ErrorKind::NotFound.code(), 1004);
    }

    #[test]
    fn test_store_error_conversion() {
        let err: ConvoyError = StoreError::Duplicate("live instance".into()).into();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err: ConvoyError = StoreError::Backend("disk full".into()).into();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
    }
}
