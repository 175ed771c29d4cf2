// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Append-only security and compliance audit store.
//!
//! Entries are never mutated or reordered; queries return copies.
//! Normal entries age out after the configured retention window,
//! compliance-tagged entries keep the long window.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use canlink::frame::epoch_ms;

use crate::config::RetentionPolicy;
use crate::monitor::PerfMonitor;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Audit entry categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    EntityControlBlocked,
    InterlockOverride,
    EmergencyStopInitiated,
    EmergencyStopCompleted,
    EmergencyStopReset,
    Injection,
    SecurityAttempt,
    SecurityThreat,
    Anomaly,
    WatchdogLapse,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EntityControlBlocked => "entity_control_blocked",
            Self::InterlockOverride => "interlock_override",
            Self::EmergencyStopInitiated => "emergency_stop_initiated",
            Self::EmergencyStopCompleted => "emergency_stop_complete",
            Self::EmergencyStopReset => "emergency_stop_reset",
            Self::Injection => "injection",
            Self::SecurityAttempt => "security_attempt",
            Self::SecurityThreat => "security_threat",
            Self::Anomaly => "bus_anomaly",
            Self::WatchdogLapse => "watchdog_lapse",
        }
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub kind: AuditKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
    pub detail: serde_json::Value,
    /// Compliance-tagged entries keep the long retention window.
    pub compliance: bool,
    pub timestamp_ms: u64,
}

/// Append-only audit log with split retention.
pub struct SecurityAuditRepository {
    monitor: PerfMonitor,
    retention: RetentionPolicy,
    entries: Mutex<Vec<AuditEntry>>,
    seq: AtomicU64,
}

impl SecurityAuditRepository {
    pub fn new(monitor: PerfMonitor, retention: RetentionPolicy) -> Self {
        Self { monitor, retention, entries: Mutex::new(Vec::new()), seq: AtomicU64::new(0) }
    }

    /// Append one entry; returns its sequence number.
    pub fn append(
        &self,
        kind: AuditKind,
        principal: Option<String>,
        detail: serde_json::Value,
        compliance: bool,
    ) -> u64 {
        self.monitor.time("audit.append", || {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
            let entry = AuditEntry {
                seq,
                kind,
                principal,
                detail,
                compliance,
                timestamp_ms: epoch_ms(),
            };
            self.entries.lock().push(entry);
            seq
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// All entries, oldest first.
    pub fn all(&self) -> Vec<AuditEntry> {
        self.monitor.time("audit.all", || self.entries.lock().clone())
    }

    pub fn by_kind(&self, kind: AuditKind) -> Vec<AuditEntry> {
        self.monitor.time("audit.by_kind", || {
            self.entries.lock().iter().filter(|e| e.kind == kind).cloned().collect()
        })
    }

    pub fn since(&self, timestamp_ms: u64) -> Vec<AuditEntry> {
        self.monitor.time("audit.since", || {
            self.entries.lock().iter().filter(|e| e.timestamp_ms >= timestamp_ms).cloned().collect()
        })
    }

    /// Drop entries past their retention window. Returns removed count.
    pub fn prune(&self, now_ms: u64) -> usize {
        self.monitor.time("audit.prune", || {
            let normal_cutoff =
                now_ms.saturating_sub(self.retention.security_audit_days as u64 * DAY_MS);
            let compliance_cutoff =
                now_ms.saturating_sub(self.retention.compliance_audit_days as u64 * DAY_MS);
            let mut entries = self.entries.lock();
            let before = entries.len();
            entries.retain(|e| {
                let cutoff = if e.compliance { compliance_cutoff } else { normal_cutoff };
                e.timestamp_ms >= cutoff
            });
            before - entries.len()
        })
    }
}

#[cfg(test)]
#[path = "audit_tests.rs"]
mod tests;
