// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Safety contract shared by every CAN service and by the platform
//! supervisor: risk classification, emergency-stop actions, and the
//! global emergency flag consulted at cooperative points.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{CanError, CanResult};
use crate::frame::epoch_ms;

/// Risk tier assigned to a service; determines behavior under emergency
/// stop and how the supervisor reacts to its failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyClassification {
    Critical,
    SafetyRelated,
    Operational,
    PositionCritical,
    Maintenance,
    Informational,
}

impl SafetyClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::SafetyRelated => "safety_related",
            Self::Operational => "operational",
            Self::PositionCritical => "position_critical",
            Self::Maintenance => "maintenance",
            Self::Informational => "informational",
        }
    }

    /// Whether services of this tier participate in the emergency-stop
    /// cascade.
    pub fn is_safety_scoped(&self) -> bool {
        matches!(self, Self::Critical | Self::SafetyRelated | Self::PositionCritical)
    }
}

/// Declared behavior of a service when emergency stop fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyAction {
    StopImmediately,
    MaintainPosition,
    ContinueOperation,
    EnterSafeMode,
}

impl EmergencyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StopImmediately => "stop_immediately",
            Self::MaintainPosition => "maintain_position",
            Self::ContinueOperation => "continue_operation",
            Self::EnterSafeMode => "enter_safe_mode",
        }
    }

    /// The outcome a healthy service reports after executing this action.
    pub fn outcome(&self) -> EmergencyOutcome {
        match self {
            Self::StopImmediately => EmergencyOutcome::Stopped,
            Self::MaintainPosition => EmergencyOutcome::Maintained,
            Self::ContinueOperation => EmergencyOutcome::Continued,
            Self::EnterSafeMode => EmergencyOutcome::SafeMode,
        }
    }
}

/// Per-service result of an emergency-stop invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyOutcome {
    Stopped,
    Maintained,
    Continued,
    SafeMode,
    Failed,
    TimedOut,
}

impl EmergencyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Maintained => "maintained",
            Self::Continued => "continued",
            Self::SafeMode => "safe_mode",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

/// Point-in-time safety view of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyStatus {
    pub service: String,
    pub classification: SafetyClassification,
    pub running: bool,
    pub emergency_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Shared global emergency flag.
///
/// Set once by the supervisor when emergency stop fires; safety-aware
/// tasks consult it at their next cooperative point. Clearing requires
/// the supervisor's reset path (operator PIN + confirmation).
#[derive(Debug, Clone, Default)]
pub struct EmergencyFlag {
    inner: Arc<FlagInner>,
}

#[derive(Debug, Default)]
struct FlagInner {
    active: AtomicBool,
    since_ms: AtomicU64,
    reason: Mutex<Option<String>>,
}

impl EmergencyFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Returns `false` if it was already active.
    pub fn set(&self, reason: impl Into<String>) -> bool {
        if self.inner.active.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.since_ms.store(epoch_ms(), Ordering::Release);
        *self.inner.reason.lock() = Some(reason.into());
        true
    }

    /// Clear the flag (supervisor reset path only).
    pub fn clear(&self) {
        self.inner.active.store(false, Ordering::Release);
        *self.inner.reason.lock() = None;
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().clone()
    }

    /// Epoch ms when the flag was last raised; 0 if never.
    pub fn since_ms(&self) -> u64 {
        self.inner.since_ms.load(Ordering::Acquire)
    }

    /// Fail an operation while the flag is active.
    pub fn guard(&self, operation: &str) -> CanResult<()> {
        if self.is_active() {
            let reason = self.reason().unwrap_or_else(|| "emergency stop".to_owned());
            return Err(CanError::emergency_stop(format!("{operation} blocked: {reason}")));
        }
        Ok(())
    }
}

/// Contract implemented by every safety-aware service.
///
/// `emergency_stop` must be bounded: the supervisor invokes handlers in
/// parallel under a timeout and records `TimedOut` for laggards.
pub trait SafetyAware: Send + Sync {
    fn name(&self) -> &str;

    fn classification(&self) -> SafetyClassification;

    fn emergency_action(&self) -> EmergencyAction;

    fn safety_status(&self) -> SafetyStatus;

    fn emergency_stop(&self, reason: &str) -> BoxFuture<'_, EmergencyOutcome>;
}

#[cfg(test)]
#[path = "safety_tests.rs"]
mod tests;
