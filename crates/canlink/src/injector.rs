// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Safety-gated frame injection.
//!
//! Injection requests pass a safety validation whose strictness depends
//! on the configured level: dangerous PGNs (engine, brake, transmission,
//! cruise, retarder, dash) are blocked in strict mode, warned in
//! moderate, and allowed in permissive. Every request and its outcome is
//! forwarded to the audit channel with the requesting principal and the
//! declared reason.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{CanError, CanResult};
use crate::frame::{epoch_ms, CanFrame, MAX_FRAME_DATA, MAX_STANDARD_ID};
use crate::safety::{
    EmergencyAction, EmergencyFlag, EmergencyOutcome, SafetyAware, SafetyClassification,
    SafetyStatus,
};

/// Hard cap on sustained injection rate per task.
pub const MAX_RATE_PER_SECOND: u64 = 100;

/// Floor on the periodic interval and inter-message gaps.
pub const MIN_INTERVAL_MS: u64 = 10;

/// PGNs that can command drivetrain or braking hardware. The deployed
/// set comes from configuration; this is the conservative default.
pub fn default_dangerous_pgns() -> HashSet<u32> {
    [
        0xFEF1, // cruise control / vehicle speed
        0xFEF2, // electronic brake controller
        0xFEF3, // electronic transmission controller
        0xFEF4, // electronic engine controller
        0xFEF5, // electronic retarder controller
        0xFEFC, // dash display
    ]
    .into_iter()
    .collect()
}

/// Validation strictness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    Strict,
    Moderate,
    Permissive,
}

impl SafetyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Moderate => "moderate",
            Self::Permissive => "permissive",
        }
    }
}

/// Injection scheduling mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum InjectionMode {
    Single,
    Burst { count: u32, gap_ms: u64 },
    /// `count: None` runs until stopped.
    Periodic { interval_ms: u64, count: Option<u32> },
    Sequence { frames: Vec<SequenceFrame>, gap_ms: u64 },
}

/// One step of a sequence injection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceFrame {
    pub can_id: u32,
    pub data: Vec<u8>,
}

/// A request to emit frames onto the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionRequest {
    pub interface: String,
    pub can_id: u32,
    pub data: Vec<u8>,
    pub mode: InjectionMode,
    /// Requesting principal, recorded in the audit trail.
    pub principal: String,
    /// Declared reason, recorded in the audit trail.
    pub reason: String,
}

/// Result of an accepted injection request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionOutcome {
    pub task_id: String,
    pub injected: u64,
    /// True when the frames run on a background task (periodic mode).
    pub background: bool,
    pub warnings: Vec<String>,
}

/// Audit record forwarded for every request, accepted or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionAudit {
    pub task_id: String,
    pub principal: String,
    pub reason: String,
    pub interface: String,
    pub can_id: u32,
    pub allowed: bool,
    pub detail: String,
    pub warnings: Vec<String>,
    pub timestamp_ms: u64,
}

/// Injection counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InjectorStats {
    pub requests: u64,
    pub injected: u64,
    pub blocked: u64,
    pub dangerous_blocked: u64,
    pub active_tasks: usize,
}

/// Safety-gated controlled frame emission.
pub struct MessageInjector {
    level: RwLock<SafetyLevel>,
    dangerous: RwLock<HashSet<u32>>,
    transmit: mpsc::Sender<CanFrame>,
    audit_tx: mpsc::Sender<InjectionAudit>,
    active: Mutex<HashMap<String, CancellationToken>>,
    stats: Mutex<InjectorStats>,
    emergency: EmergencyFlag,
    running: AtomicBool,
}

impl MessageInjector {
    /// `transmit` is the facade's bounded transmit queue; `audit_tx`
    /// feeds the audit logger.
    pub fn new(
        level: SafetyLevel,
        dangerous: HashSet<u32>,
        transmit: mpsc::Sender<CanFrame>,
        audit_tx: mpsc::Sender<InjectionAudit>,
        emergency: EmergencyFlag,
    ) -> Self {
        Self {
            level: RwLock::new(level),
            dangerous: RwLock::new(dangerous),
            transmit,
            audit_tx,
            active: Mutex::new(HashMap::new()),
            stats: Mutex::new(InjectorStats::default()),
            emergency,
            running: AtomicBool::new(true),
        }
    }

    pub fn safety_level(&self) -> SafetyLevel {
        *self.level.read()
    }

    pub fn set_safety_level(&self, level: SafetyLevel) {
        tracing::info!(level = level.as_str(), "injector safety level changed");
        *self.level.write() = level;
    }

    /// PGN carried by a 29-bit id, canonicalized for the dangerous set
    /// (the data-page bit is masked so RV-C aliases of chassis PGNs are
    /// caught too).
    fn extract_pgn(can_id: u32) -> u32 {
        ((can_id >> 8) & 0x3FFFF) & 0xFFFF
    }

    /// Validate a request. Returns warnings; dangerous PGNs in strict
    /// mode and malformed frames fail outright.
    fn validate(&self, request: &InjectionRequest) -> CanResult<Vec<String>> {
        self.emergency.guard("inject")?;
        if !self.running.load(Ordering::Acquire) {
            return Err(CanError::conflict("injector is stopped"));
        }

        let mut warnings = Vec::new();
        let mut check_frame = |can_id: u32, data: &[u8]| -> CanResult<()> {
            if data.len() > MAX_FRAME_DATA {
                return Err(CanError::invalid_input(format!(
                    "payload of {} bytes exceeds classic CAN limit",
                    data.len()
                )));
            }
            if can_id > crate::frame::MAX_EXTENDED_ID {
                return Err(CanError::invalid_input(format!("can id {can_id:#x} exceeds 29 bits")));
            }
            if can_id > MAX_STANDARD_ID {
                let pgn = Self::extract_pgn(can_id);
                if self.dangerous.read().contains(&pgn) {
                    match *self.level.read() {
                        SafetyLevel::Strict => {
                            self.stats.lock().dangerous_blocked += 1;
                            return Err(CanError::interlock(format!(
                                "pgn {pgn:#x} is in the dangerous set"
                            )));
                        }
                        SafetyLevel::Moderate => {
                            warnings.push(format!("pgn {pgn:#x} is in the dangerous set"));
                        }
                        SafetyLevel::Permissive => {}
                    }
                }
            }
            Ok(())
        };

        match &request.mode {
            InjectionMode::Single => check_frame(request.can_id, &request.data)?,
            InjectionMode::Burst { count, gap_ms } => {
                if *count == 0 {
                    return Err(CanError::invalid_input("burst count must be positive"));
                }
                if *gap_ms < MIN_INTERVAL_MS {
                    return Err(CanError::invalid_input(format!(
                        "burst gap {gap_ms} ms below the {MIN_INTERVAL_MS} ms floor"
                    )));
                }
                check_frame(request.can_id, &request.data)?;
            }
            InjectionMode::Periodic { interval_ms, .. } => {
                if *interval_ms < MIN_INTERVAL_MS {
                    return Err(CanError::invalid_input(format!(
                        "periodic interval {interval_ms} ms below the {MIN_INTERVAL_MS} ms floor"
                    )));
                }
                if 1000 / (*interval_ms).max(1) > MAX_RATE_PER_SECOND {
                    return Err(CanError::invalid_input(format!(
                        "periodic rate exceeds {MAX_RATE_PER_SECOND} msg/s"
                    )));
                }
                check_frame(request.can_id, &request.data)?;
            }
            InjectionMode::Sequence { frames, gap_ms } => {
                if frames.is_empty() {
                    return Err(CanError::invalid_input("sequence must contain frames"));
                }
                if *gap_ms < MIN_INTERVAL_MS {
                    return Err(CanError::invalid_input(format!(
                        "sequence gap {gap_ms} ms below the {MIN_INTERVAL_MS} ms floor"
                    )));
                }
                for step in frames {
                    check_frame(step.can_id, &step.data)?;
                }
            }
        }
        Ok(warnings)
    }

    fn audit(&self, task_id: &str, request: &InjectionRequest, allowed: bool, detail: &str, warnings: &[String]) {
        let record = InjectionAudit {
            task_id: task_id.to_owned(),
            principal: request.principal.clone(),
            reason: request.reason.clone(),
            interface: request.interface.clone(),
            can_id: request.can_id,
            allowed,
            detail: detail.to_owned(),
            warnings: warnings.to_vec(),
            timestamp_ms: epoch_ms(),
        };
        if self.audit_tx.try_send(record).is_err() {
            tracing::warn!(task_id, "injection audit channel full, record dropped");
        }
    }

    fn build_frame(&self, interface: &str, can_id: u32, data: &[u8]) -> CanResult<CanFrame> {
        CanFrame::new(interface, can_id, data.to_vec())
    }

    fn send(&self, frame: CanFrame) -> CanResult<()> {
        self.transmit
            .try_send(frame)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    CanError::queue_full("transmit queue saturated")
                }
                mpsc::error::TrySendError::Closed(_) => CanError::internal("transmit queue closed"),
            })
    }

    /// Execute an injection request.
    ///
    /// Single, burst, and sequence modes run inline; periodic mode spawns
    /// a background task and returns immediately. Rejected requests are
    /// audited with the rejection detail.
    pub async fn inject(self: &std::sync::Arc<Self>, request: InjectionRequest) -> CanResult<InjectionOutcome> {
        let task_id = Uuid::new_v4().to_string();
        self.stats.lock().requests += 1;

        let warnings = match self.validate(&request) {
            Ok(warnings) => warnings,
            Err(e) => {
                self.stats.lock().blocked += 1;
                self.audit(&task_id, &request, false, &e.to_string(), &[]);
                return Err(e);
            }
        };
        self.audit(&task_id, &request, true, "accepted", &warnings);

        match request.mode.clone() {
            InjectionMode::Single => {
                let frame = self.build_frame(&request.interface, request.can_id, &request.data)?;
                self.send(frame)?;
                self.stats.lock().injected += 1;
                Ok(InjectionOutcome { task_id, injected: 1, background: false, warnings })
            }
            InjectionMode::Burst { count, gap_ms } => {
                let frame = self.build_frame(&request.interface, request.can_id, &request.data)?;
                let mut injected = 0u64;
                for i in 0..count {
                    if i > 0 {
                        tokio::time::sleep(Duration::from_millis(gap_ms)).await;
                    }
                    self.emergency.guard("inject")?;
                    self.send(frame.clone())?;
                    injected += 1;
                }
                self.stats.lock().injected += injected;
                Ok(InjectionOutcome { task_id, injected, background: false, warnings })
            }
            InjectionMode::Sequence { frames, gap_ms } => {
                let mut injected = 0u64;
                for (i, step) in frames.iter().enumerate() {
                    if i > 0 {
                        tokio::time::sleep(Duration::from_millis(gap_ms)).await;
                    }
                    self.emergency.guard("inject")?;
                    let frame = self.build_frame(&request.interface, step.can_id, &step.data)?;
                    self.send(frame)?;
                    injected += 1;
                }
                self.stats.lock().injected += injected;
                Ok(InjectionOutcome { task_id, injected, background: false, warnings })
            }
            InjectionMode::Periodic { interval_ms, count } => {
                let cancel = CancellationToken::new();
                self.active.lock().insert(task_id.clone(), cancel.clone());
                let this = std::sync::Arc::clone(self);
                let frame = self.build_frame(&request.interface, request.can_id, &request.data)?;
                let id = task_id.clone();
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
                    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    let mut sent = 0u64;
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = interval.tick() => {}
                        }
                        if this.emergency.is_active() || !this.running.load(Ordering::Acquire) {
                            break;
                        }
                        if this.send(frame.clone()).is_err() {
                            tracing::warn!(task_id = %id, "periodic injection dropped frame");
                        } else {
                            sent += 1;
                            this.stats.lock().injected += 1;
                        }
                        if let Some(limit) = count {
                            if sent >= limit as u64 {
                                break;
                            }
                        }
                    }
                    this.active.lock().remove(&id);
                    tracing::debug!(task_id = %id, sent, "periodic injection finished");
                });
                Ok(InjectionOutcome { task_id, injected: 0, background: true, warnings })
            }
        }
    }

    /// Stop one periodic task, or every active task when `task_id` is
    /// `None`. Returns the number of tasks cancelled.
    pub fn stop(&self, task_id: Option<&str>) -> usize {
        let mut active = self.active.lock();
        match task_id {
            Some(id) => match active.remove(id) {
                Some(token) => {
                    token.cancel();
                    1
                }
                None => 0,
            },
            None => {
                let count = active.len();
                for (_, token) in active.drain() {
                    token.cancel();
                }
                count
            }
        }
    }

    pub fn statistics(&self) -> InjectorStats {
        let mut stats = self.stats.lock().clone();
        stats.active_tasks = self.active.lock().len();
        stats
    }
}

impl SafetyAware for MessageInjector {
    fn name(&self) -> &str {
        "message_injector"
    }

    fn classification(&self) -> SafetyClassification {
        SafetyClassification::Critical
    }

    fn emergency_action(&self) -> EmergencyAction {
        EmergencyAction::StopImmediately
    }

    fn safety_status(&self) -> SafetyStatus {
        SafetyStatus {
            service: "message_injector".to_owned(),
            classification: SafetyClassification::Critical,
            running: self.running.load(Ordering::Acquire),
            emergency_active: self.emergency.is_active(),
            reason: self.emergency.reason(),
        }
    }

    fn emergency_stop(&self, reason: &str) -> futures_util::future::BoxFuture<'_, EmergencyOutcome> {
        self.running.store(false, Ordering::Release);
        let stopped = self.stop(None);
        tracing::warn!(reason, stopped, "message injector stopped");
        Box::pin(async move { self.emergency_action().outcome() })
    }
}

#[cfg(test)]
#[path = "injector_tests.rs"]
mod tests;
