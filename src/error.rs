//! Error types for the cosync synchronization engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure kinds reported to clients as structured replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidParams,
    Unauthorized,
    AdmissionDenied,
    UnknownTarget,
    UnknownRequest,
    NotAMember,
    HandlerError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidParams => "InvalidParams",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::AdmissionDenied => "AdmissionDenied",
            ErrorKind::UnknownTarget => "UnknownTarget",
            ErrorKind::UnknownRequest => "UnknownRequest",
            ErrorKind::NotAMember => "NotAMember",
            ErrorKind::HandlerError => "HandlerError",
        };
        f.write_str(name)
    }
}

/// Engine errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{0}")]
    InvalidParams(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    AdmissionDenied(String),

    #[error("{0}")]
    UnknownTarget(String),

    #[error("{0}")]
    UnknownRequest(String),

    #[error("{0}")]
    NotAMember(String),

    #[error("{0}")]
    HandlerError(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Reply kind for this error, if it is one clients see.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            SyncError::InvalidParams(_) => Some(ErrorKind::InvalidParams),
            SyncError::Unauthorized(_) => Some(ErrorKind::Unauthorized),
            SyncError::AdmissionDenied(_) => Some(ErrorKind::AdmissionDenied),
            SyncError::UnknownTarget(_) => Some(ErrorKind::UnknownTarget),
            SyncError::UnknownRequest(_) => Some(ErrorKind::UnknownRequest),
            SyncError::NotAMember(_) => Some(ErrorKind::NotAMember),
            SyncError::HandlerError(_) => Some(ErrorKind::HandlerError),
            SyncError::Config(_) | SyncError::Protocol(_) | SyncError::Io(_) => None,
        }
    }

    /// Wrap a user capability failure as a handler error.
    pub fn handler(err: &anyhow::Error) -> Self {
        SyncError::HandlerError(err.to_string())
    }
}

/// Transport payloads that could not be decoded. Rejected before reaching the core.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Empty message")]
    Empty,
}

impl From<config::ConfigError> for SyncError {
    fn from(err: config::ConfigError) -> Self {
        SyncError::Config(err.to_string())
    }
}
