//! Failure taxonomy of the request surface.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of a call-fatal failure. Serialized names match the callable
/// error codes clients already switch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Unauthenticated,
    InvalidArgument,
    ResourceExhausted,
    NotFound,
    PermissionDenied,
    FailedPrecondition,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::InvalidArgument => "invalid-argument",
            Self::ResourceExhausted => "resource-exhausted",
            Self::NotFound => "not-found",
            Self::PermissionDenied => "permission-denied",
            Self::FailedPrecondition => "failed-precondition",
            Self::Internal => "internal",
        }
    }

    /// Process exit code used by the CLI surface.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Unauthenticated => 10,
            Self::InvalidArgument => 11,
            Self::ResourceExhausted => 12,
            Self::NotFound => 13,
            Self::PermissionDenied => 14,
            Self::FailedPrecondition => 15,
            Self::Internal => 16,
        }
    }
}

/// A failure that aborts the whole call before (or instead of) any
/// mutation. Per-panel failures are never represented this way.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{}: {message}", kind.as_str())]
pub struct ApiError {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl ApiError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after_seconds: None,
        }
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unauthenticated, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidArgument, message)
    }

    pub fn resource_exhausted(message: impl Into<String>, retry_after_seconds: Option<u64>) -> Self {
        Self {
            kind: FailureKind::ResourceExhausted,
            message: message.into(),
            retry_after_seconds,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FailureKind::NotFound, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(FailureKind::PermissionDenied, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(FailureKind::FailedPrecondition, message)
    }

    /// Generic internal failure. The underlying chain belongs in the event
    /// log, not in the message handed back to clients.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Internal, message)
    }

    pub fn is(&self, kind: FailureKind) -> bool {
        self.kind == kind
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(_err: anyhow::Error) -> Self {
        Self::internal("An internal error occurred. Please try again later.")
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
