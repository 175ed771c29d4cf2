// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for the CAN layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CanErrorKind {
    InvalidInput,
    OutOfRange,
    NotFound,
    Conflict,
    InterlockViolated,
    TransmitQueueFull,
    EmergencyStopActive,
    Timeout,
    Internal,
}

impl CanErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidInput => "INVALID_INPUT",
            Self::OutOfRange => "OUT_OF_RANGE",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::InterlockViolated => "INTERLOCK_VIOLATED",
            Self::TransmitQueueFull => "TRANSMIT_QUEUE_FULL",
            Self::EmergencyStopActive => "EMERGENCY_STOP_ACTIVE",
            Self::Timeout => "TIMEOUT",
            Self::Internal => "INTERNAL",
        }
    }

    /// Whether a caller may retry after a short delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransmitQueueFull | Self::Timeout)
    }
}

impl fmt::Display for CanErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CAN layer error with machine-readable kind and human-readable message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanError {
    pub kind: CanErrorKind,
    pub message: String,
}

impl CanError {
    pub fn new(kind: CanErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(CanErrorKind::InvalidInput, message)
    }

    pub fn out_of_range(message: impl Into<String>) -> Self {
        Self::new(CanErrorKind::OutOfRange, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(CanErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(CanErrorKind::Conflict, message)
    }

    pub fn interlock(message: impl Into<String>) -> Self {
        Self::new(CanErrorKind::InterlockViolated, message)
    }

    pub fn queue_full(message: impl Into<String>) -> Self {
        Self::new(CanErrorKind::TransmitQueueFull, message)
    }

    pub fn emergency_stop(message: impl Into<String>) -> Self {
        Self::new(CanErrorKind::EmergencyStopActive, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(CanErrorKind::Timeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(CanErrorKind::Internal, message)
    }
}

impl fmt::Display for CanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CanError {}

pub type CanResult<T> = Result<T, CanError>;
