use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncErrorCode {
    InvalidArgument,
    FailedPrecondition,
    Aborted,
    NotFound,
    Internal,
    Unavailable,
}

impl SyncErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncErrorCode::InvalidArgument => "sync/invalid-argument",
            SyncErrorCode::FailedPrecondition => "sync/failed-precondition",
            SyncErrorCode::Aborted => "sync/aborted",
            SyncErrorCode::NotFound => "sync/not-found",
            SyncErrorCode::Internal => "sync/internal",
            SyncErrorCode::Unavailable => "sync/unavailable",
        }
    }
}

/// Error type shared by every component of the sync core.
///
/// `Internal` marks invariant violations (programmer errors) that must abort
/// the enclosing transaction; `Aborted` marks recoverable read-version
/// conflicts the caller may retry.
#[derive(Clone, Debug)]
pub struct SyncError {
    pub code: SyncErrorCode,
    message: String,
}

impl SyncError {
    pub fn new(code: SyncErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }
}

impl Display for SyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for SyncError {}

pub type SyncResult<T> = Result<T, SyncError>;

pub fn invalid_argument(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::InvalidArgument, message)
}

pub fn failed_precondition(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::FailedPrecondition, message)
}

pub fn aborted(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Aborted, message)
}

pub fn not_found(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::NotFound, message)
}

pub fn internal_error(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Internal, message)
}

pub fn unavailable(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Unavailable, message)
}
