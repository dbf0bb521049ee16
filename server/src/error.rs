//! Error kinds surfaced at the coordination core's API boundary.

use shared::AuthResult;
use std::fmt;
use thiserror::Error;

/// Fieldless view of [`CoreError`] for matching and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    PreconditionFailed,
    PermissionDenied,
    RateLimited,
    Banned,
    Capacity,
    Timeout,
    DependencyCycle,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::PreconditionFailed => "PreconditionFailed",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::RateLimited => "RateLimited",
            ErrorKind::Banned => "Banned",
            ErrorKind::Capacity => "Capacity",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::DependencyCycle => "DependencyCycle",
            ErrorKind::Internal => "Internal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Shape or validation failure; nothing was changed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown session, quest, dialog or subsystem.
    #[error("not found: {0}")]
    NotFound(String),

    /// The state machine rejects the requested transition.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The actor does not outrank the target or lacks the capability.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("banned: {0}")]
    Banned(String),

    /// Server full or dialog at participant cap.
    #[error("capacity reached: {0}")]
    Capacity(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("dependency cycle: {0}")]
    DependencyCycle(String),

    /// Invariant violation the caller cannot recover from locally.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            CoreError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            CoreError::RateLimited(_) => ErrorKind::RateLimited,
            CoreError::Banned(_) => ErrorKind::Banned,
            CoreError::Capacity(_) => ErrorKind::Capacity,
            CoreError::Timeout(_) => ErrorKind::Timeout,
            CoreError::DependencyCycle(_) => ErrorKind::DependencyCycle,
            CoreError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn not_found(what: &str, id: impl fmt::Display) -> Self {
        CoreError::NotFound(format!("{} {}", what, id))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Why an authentication attempt was refused, in host-facing terms.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} ({})", .code.name(), .message)]
pub struct AuthRejection {
    pub code: AuthResult,
    pub message: String,
}

impl AuthRejection {
    pub fn new(code: AuthResult, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<AuthRejection> for CoreError {
    fn from(rejection: AuthRejection) -> Self {
        let message = rejection.to_string();
        match rejection.code {
            AuthResult::TooManyAttempts => CoreError::RateLimited(message),
            AuthResult::AccountBanned | AuthResult::AccountSuspended => CoreError::Banned(message),
            AuthResult::ServerFull => CoreError::Capacity(message),
            AuthResult::RequiredDataMissing | AuthResult::VersionMismatch => {
                CoreError::InvalidArgument(message)
            }
            AuthResult::MaintenanceMode => CoreError::PreconditionFailed(message),
            AuthResult::InvalidCredentials => CoreError::PermissionDenied(message),
            AuthResult::NetworkError | AuthResult::Success => CoreError::Internal(message),
        }
    }
}
