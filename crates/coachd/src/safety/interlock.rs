// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Safety interlocks: pure predicates over observed chassis state.
//!
//! An interlock either holds or fails with a stable reason string; the
//! reason travels in the `InterlockViolated` error and the audit trail.
//! Overrides are not evaluated here — the safety service validates an
//! override-class PIN and bypasses the check explicitly, always with an
//! audit entry.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use canlink::frame::DecodedFrame;
use canlink::spec::dgn;

use crate::config::EntityKind;
use crate::error::{CoreError, CoreResult};

/// Chassis inputs the interlock predicates read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChassisState {
    pub speed_kmh: f64,
    pub parking_brake_engaged: bool,
    pub jacks_deployed: bool,
    pub ignition_on: bool,
    pub updated_ms: u64,
}

impl Default for ChassisState {
    fn default() -> Self {
        // Until the bus reports, assume the most restrictive posture:
        // moving, brake released, jacks down.
        Self {
            speed_kmh: f64::MAX,
            parking_brake_engaged: false,
            jacks_deployed: true,
            ignition_on: false,
            updated_ms: 0,
        }
    }
}

/// A single interlock predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterlockRule {
    VehicleStationary,
    ParkingBrakeEngaged,
    JacksRetracted,
}

impl InterlockRule {
    /// Stable violation reason for audit and error payloads.
    pub fn violation_reason(&self) -> &'static str {
        match self {
            Self::VehicleStationary => "vehicle_in_motion",
            Self::ParkingBrakeEngaged => "parking_brake_released",
            Self::JacksRetracted => "leveling_jacks_deployed",
        }
    }

    fn holds(&self, chassis: &ChassisState) -> bool {
        match self {
            Self::VehicleStationary => chassis.speed_kmh == 0.0,
            Self::ParkingBrakeEngaged => chassis.parking_brake_engaged,
            Self::JacksRetracted => !chassis.jacks_deployed,
        }
    }
}

/// Interlock rules guarding one device kind's movement commands.
fn rules_for(kind: EntityKind) -> &'static [InterlockRule] {
    match kind {
        EntityKind::Slide => &[
            InterlockRule::ParkingBrakeEngaged,
            InterlockRule::JacksRetracted,
            InterlockRule::VehicleStationary,
        ],
        EntityKind::Awning => &[InterlockRule::VehicleStationary],
        // Lights, switches, HVAC, and read-only kinds move nothing.
        _ => &[],
    }
}

/// Evaluates interlocks against the latest chassis snapshot.
#[derive(Debug, Default)]
pub struct InterlockEngine {
    chassis: RwLock<ChassisState>,
}

impl InterlockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current chassis snapshot.
    pub fn chassis(&self) -> ChassisState {
        self.chassis.read().clone()
    }

    /// Replace the chassis snapshot (tests and simulation).
    pub fn set_chassis(&self, chassis: ChassisState) {
        *self.chassis.write() = chassis;
    }

    /// Fold a decoded chassis status frame into the snapshot.
    pub fn observe(&self, frame: &DecodedFrame) {
        if frame.pgn != Some(dgn::CHASSIS_MOBILITY_STATUS) {
            return;
        }
        let mut chassis = self.chassis.write();
        if let Some(speed) = frame.value("speed") {
            chassis.speed_kmh = speed;
        }
        if let Some(brake) = frame.raw("parking_brake") {
            // Two-bit field: 0 released, 1 engaged, 3 not available.
            if brake <= 1 {
                chassis.parking_brake_engaged = brake == 1;
            }
        }
        if let Some(jacks) = frame.raw("leveling_jacks") {
            if jacks <= 1 {
                chassis.jacks_deployed = jacks == 1;
            }
        }
        if let Some(ignition) = frame.raw("ignition") {
            if ignition <= 1 {
                chassis.ignition_on = ignition == 1;
            }
        }
        chassis.updated_ms = frame.frame.timestamp_ms.max(chassis.updated_ms);
    }

    /// Check every interlock guarding a movement command for `kind`.
    ///
    /// Hard fail with the first violated rule's reason.
    pub fn check(&self, kind: EntityKind, operation: &str) -> CoreResult<()> {
        let chassis = self.chassis.read();
        for rule in rules_for(kind) {
            if !rule.holds(&chassis) {
                let reason = rule.violation_reason();
                tracing::warn!(kind = kind.as_str(), operation, reason, "interlock violated");
                return Err(CoreError::interlock(reason));
            }
        }
        Ok(())
    }

    /// Rules that would be evaluated for a kind (introspection surface).
    pub fn rules(&self, kind: EntityKind) -> Vec<InterlockRule> {
        rules_for(kind).to_vec()
    }
}

#[cfg(test)]
#[path = "interlock_tests.rs"]
mod tests;
