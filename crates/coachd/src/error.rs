// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use canlink::error::{CanError, CanErrorKind};

/// Closed set of platform error kinds. Each kind carries a fixed
/// propagation policy; the HTTP collaborator maps them through
/// [`ErrorKind::http_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    Forbidden,
    InterlockViolated,
    Conflict,
    ServiceUnavailable,
    CircuitOpen,
    TransmitQueueFull,
    Timeout,
    EmergencyStopActive,
    CircularDependency,
    Internal,
}

impl ErrorKind {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::InvalidInput => 400,
            Self::Forbidden => 403,
            Self::InterlockViolated => 409,
            Self::Conflict => 409,
            Self::ServiceUnavailable => 503,
            Self::CircuitOpen => 503,
            Self::TransmitQueueFull => 503,
            Self::Timeout => 504,
            Self::EmergencyStopActive => 409,
            Self::CircularDependency => 500,
            Self::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::InvalidInput => "INVALID_INPUT",
            Self::Forbidden => "FORBIDDEN",
            Self::InterlockViolated => "INTERLOCK_VIOLATED",
            Self::Conflict => "CONFLICT",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::TransmitQueueFull => "TRANSMIT_QUEUE_FULL",
            Self::Timeout => "TIMEOUT",
            Self::EmergencyStopActive => "EMERGENCY_STOP_ACTIVE",
            Self::CircularDependency => "CIRCULAR_DEPENDENCY",
            Self::Internal => "INTERNAL",
        }
    }

    /// Transient kinds may be retried after a short delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::CircuitOpen | Self::TransmitQueueFull | Self::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Platform error: machine-readable kind, human-readable message, and a
/// retry hint for transient kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), retry_after_ms: None }
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after_ms = Some(delay.as_millis() as u64);
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn interlock(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InterlockViolated, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceUnavailable, message)
    }

    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CircuitOpen, message).with_retry_after(Duration::from_secs(5))
    }

    pub fn queue_full(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransmitQueueFull, message).with_retry_after(Duration::from_millis(50))
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn emergency_stop(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::EmergencyStopActive, message)
    }

    pub fn circular_dependency(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CircularDependency, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CoreError {}

impl From<CanError> for CoreError {
    fn from(err: CanError) -> Self {
        let kind = match err.kind {
            CanErrorKind::InvalidInput => ErrorKind::InvalidInput,
            CanErrorKind::OutOfRange => ErrorKind::InvalidInput,
            CanErrorKind::NotFound => ErrorKind::NotFound,
            CanErrorKind::Conflict => ErrorKind::Conflict,
            CanErrorKind::InterlockViolated => ErrorKind::InterlockViolated,
            CanErrorKind::TransmitQueueFull => ErrorKind::TransmitQueueFull,
            CanErrorKind::EmergencyStopActive => ErrorKind::EmergencyStopActive,
            CanErrorKind::Timeout => ErrorKind::Timeout,
            CanErrorKind::Internal => ErrorKind::Internal,
        };
        let error = CoreError::new(kind, err.message);
        if kind == ErrorKind::TransmitQueueFull {
            error.with_retry_after(Duration::from_millis(50))
        } else {
            error
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
