use thiserror::Error;

use crate::wire::{ErrorKind, Response};

/// The two failure kinds a caller can observe. Everything recoverable is
/// folded into one of these at the request boundary; identity-switch
/// failures never get this far (they abort the process).
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The request could not even be attempted correctly (credential
    /// resolution, registry bookkeeping, spawn plumbing).
    #[error("internal error: {0}")]
    Internal(String),
    /// The attempt was made correctly but the operation legitimately
    /// failed (bad path, package not found, tool reported failure).
    #[error("{0}")]
    OperationFailed(String),
}

impl ServiceError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn operation_failed(message: impl Into<String>) -> Self {
        Self::OperationFailed(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Internal(_) => ErrorKind::InternalError,
            Self::OperationFailed(_) => ErrorKind::OperationFailed,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Internal(message) | Self::OperationFailed(message) => message,
        }
    }

    pub fn into_response(self) -> Response {
        Response::Error {
            kind: self.kind(),
            message: self.message().to_string(),
        }
    }
}
