//! Error taxonomy surfaced at the SDK boundary.
//!
//! Every surfaced error maps to a stable [`ErrorCode`] and carries a
//! `recoverable` flag so callers can distinguish "retry later" from "give
//! up". Storage backends use the narrower [`StorageError`] internally; it is
//! folded into [`SdkError::Storage`] at the substrate boundary.

use serde::{Deserialize, Serialize};

/// Stable error codes exposed to embedders and over events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidCredentials,
    TokenExpired,
    TokenInvalid,
    RefreshFailed,
    NetworkError,
    StorageError,
    PermissionDenied,
    SessionExpired,
    MfaRequired,
    AccountLocked,
    QueueFull,
    MaxRetriesExceeded,
    CircuitOpen,
    ValidationError,
    Conflict,
    UnknownError,
}

impl ErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidCredentials => "INVALID_CREDENTIALS",
            ErrorCode::TokenExpired => "TOKEN_EXPIRED",
            ErrorCode::TokenInvalid => "TOKEN_INVALID",
            ErrorCode::RefreshFailed => "REFRESH_FAILED",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::StorageError => "STORAGE_ERROR",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::SessionExpired => "SESSION_EXPIRED",
            ErrorCode::MfaRequired => "MFA_REQUIRED",
            ErrorCode::AccountLocked => "ACCOUNT_LOCKED",
            ErrorCode::QueueFull => "QUEUE_FULL",
            ErrorCode::MaxRetriesExceeded => "MAX_RETRIES_EXCEEDED",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

/// Errors produced by storage backends and the substrate.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backend has no room left. The substrate sweeps once and retries
    /// before surfacing this.
    #[error("storage quota exceeded")]
    QuotaExceeded,
    #[error("storage backend unavailable: {reason}")]
    BackendUnavailable { reason: String },
    /// A persisted entry could not be parsed. The entry is deleted and counted.
    #[error("corrupted entry at {key}")]
    Corrupted { key: String },
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// The SDK-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum SdkError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("account locked")]
    AccountLocked,
    #[error("rate limited")]
    RateLimited,
    #[error("access token expired")]
    TokenExpired,
    #[error("invalid token: {reason}")]
    TokenInvalid { reason: String },
    #[error("token refresh failed after {attempts} attempts")]
    RefreshFailed { attempts: u32 },
    #[error("network error: {message}")]
    Network { message: String },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("encryption error: {message}")]
    Encryption { message: String },
    #[error("encryption unavailable: {reason}")]
    EncryptionUnavailable { reason: String },
    #[error("permission denied: {reason}")]
    PermissionDenied { reason: String },
    #[error("session expired")]
    SessionExpired,
    #[error("multi-factor authentication required")]
    MfaRequired,
    #[error("queue is full")]
    QueueFull,
    #[error("max retries exceeded for item {item_id}")]
    MaxRetriesExceeded { item_id: String },
    #[error("circuit open for resource {resource}")]
    CircuitOpen { resource: String },
    #[error("validation error: {message}")]
    Validation { message: String },
    #[error("conflict on {resource}: {message}")]
    Conflict { resource: String, message: String },
    #[error("not found: {what}")]
    NotFound { what: String },
    /// The component was destroyed while the operation was pending.
    #[error("component destroyed")]
    Destroyed,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SdkError {
    /// The stable boundary code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            SdkError::InvalidCredentials => ErrorCode::InvalidCredentials,
            SdkError::AccountLocked => ErrorCode::AccountLocked,
            SdkError::RateLimited => ErrorCode::NetworkError,
            SdkError::TokenExpired => ErrorCode::TokenExpired,
            SdkError::TokenInvalid { .. } => ErrorCode::TokenInvalid,
            SdkError::RefreshFailed { .. } => ErrorCode::RefreshFailed,
            SdkError::Network { .. } => ErrorCode::NetworkError,
            SdkError::Storage(_) => ErrorCode::StorageError,
            SdkError::Encryption { .. } | SdkError::EncryptionUnavailable { .. } => {
                ErrorCode::StorageError
            }
            SdkError::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            SdkError::SessionExpired => ErrorCode::SessionExpired,
            SdkError::MfaRequired => ErrorCode::MfaRequired,
            SdkError::QueueFull => ErrorCode::QueueFull,
            SdkError::MaxRetriesExceeded { .. } => ErrorCode::MaxRetriesExceeded,
            SdkError::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            SdkError::Validation { .. } => ErrorCode::ValidationError,
            SdkError::Conflict { .. } => ErrorCode::Conflict,
            SdkError::NotFound { .. } => ErrorCode::UnknownError,
            SdkError::Destroyed | SdkError::Internal(_) => ErrorCode::UnknownError,
        }
    }

    /// Whether the caller may reasonably retry the failed operation.
    #[must_use]
    pub fn recoverable(&self) -> bool {
        match self {
            SdkError::RateLimited
            | SdkError::Network { .. }
            | SdkError::TokenExpired
            | SdkError::QueueFull
            | SdkError::CircuitOpen { .. } => true,
            SdkError::Storage(inner) => matches!(
                inner,
                StorageError::QuotaExceeded | StorageError::BackendUnavailable { .. }
            ),
            _ => false,
        }
    }

    /// Structured view of the error for events and telemetry.
    #[must_use]
    pub fn report(&self, now: i64) -> ErrorReport {
        ErrorReport {
            code: self.code(),
            message: self.to_string(),
            recoverable: self.recoverable(),
            timestamp: now,
        }
    }
}

/// Serializable error summary carried over the event bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub code: ErrorCode,
    pub message: String,
    pub recoverable: bool,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_use_the_wire_spelling() {
        assert_eq!(ErrorCode::InvalidCredentials.as_str(), "INVALID_CREDENTIALS");
        assert_eq!(ErrorCode::MaxRetriesExceeded.as_str(), "MAX_RETRIES_EXCEEDED");
        let json = serde_json::to_string(&ErrorCode::CircuitOpen).unwrap();
        assert_eq!(json, "\"CIRCUIT_OPEN\"");
    }

    #[test]
    fn recoverable_classification() {
        assert!(SdkError::Network { message: "down".into() }.recoverable());
        assert!(SdkError::RateLimited.recoverable());
        assert!(SdkError::Storage(StorageError::QuotaExceeded).recoverable());
        assert!(!SdkError::InvalidCredentials.recoverable());
        assert!(!SdkError::Validation { message: "bad".into() }.recoverable());
        assert!(!SdkError::Destroyed.recoverable());
    }

    #[test]
    fn report_carries_code_and_flag() {
        let err = SdkError::QueueFull;
        let report = err.report(42);
        assert_eq!(report.code, ErrorCode::QueueFull);
        assert!(report.recoverable);
        assert_eq!(report.timestamp, 42);
    }

    #[test]
    fn storage_error_folds_into_sdk_error() {
        let err: SdkError = StorageError::BackendUnavailable { reason: "gone".into() }.into();
        assert_eq!(err.code(), ErrorCode::StorageError);
    }
}
