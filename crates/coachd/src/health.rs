// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Health probe evaluation.
//!
//! Four probes with distinct semantics, served over HTTP by an external
//! collaborator: `liveness` (is the executor responsive), `startup` (is
//! the CAN hardware bound), `readiness` (can the system serve traffic),
//! and `health` (human-readable summary, never a hard failure).
//! Responses follow the health+json shape: status pass/warn/fail, a
//! component breakdown, response time, and the release id.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use canlink::facade::CanFacade;

use crate::entity::EntityManager;
use crate::registry::{ServiceRegistry, ServiceState};
use crate::safety::SafetyService;

/// health+json status value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Pass,
    Warn,
    Fail,
}

impl ProbeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Warn => "warn",
            Self::Fail => "fail",
        }
    }

    fn worst(self, other: Self) -> Self {
        use ProbeStatus::*;
        match (self, other) {
            (Fail, _) | (_, Fail) => Fail,
            (Warn, _) | (_, Warn) => Warn,
            _ => Pass,
        }
    }
}

/// One component's contribution to a probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: ProbeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// health+json response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ProbeStatus,
    pub components: Vec<ComponentHealth>,
    pub response_time_ms: u64,
    pub release_id: String,
}

/// Programmatic health probe surface.
pub struct HealthProbes {
    registry: Arc<ServiceRegistry>,
    facade: Arc<CanFacade>,
    entities: Arc<EntityManager>,
    safety: Arc<SafetyService>,
    release_id: String,
}

impl HealthProbes {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        facade: Arc<CanFacade>,
        entities: Arc<EntityManager>,
        safety: Arc<SafetyService>,
        release_id: impl Into<String>,
    ) -> Self {
        Self { registry, facade, entities, safety, release_id: release_id.into() }
    }

    fn respond(&self, started: Instant, components: Vec<ComponentHealth>) -> HealthResponse {
        let status = components
            .iter()
            .fold(ProbeStatus::Pass, |acc, c| acc.worst(c.status));
        HealthResponse {
            status,
            components,
            response_time_ms: started.elapsed().as_millis() as u64,
            release_id: self.release_id.clone(),
        }
    }

    /// Is the process scheduler alive? Checks nothing but executor
    /// responsiveness; expected to answer in under 5 ms.
    pub fn liveness(&self) -> HealthResponse {
        let started = Instant::now();
        self.respond(
            started,
            vec![ComponentHealth {
                name: "executor".to_owned(),
                status: ProbeStatus::Pass,
                detail: None,
            }],
        )
    }

    /// Is the hardware initialized? Succeeds once the CAN interfaces
    /// are bound.
    pub fn startup(&self) -> HealthResponse {
        let started = Instant::now();
        let bound = self.facade.bound_interfaces();
        let status = if bound.is_empty() { ProbeStatus::Fail } else { ProbeStatus::Pass };
        self.respond(
            started,
            vec![ComponentHealth {
                name: "can_interfaces".to_owned(),
                status,
                detail: Some(format!("{} bound", bound.len())),
            }],
        )
    }

    /// Is the system able to serve traffic?
    pub fn readiness(&self) -> HealthResponse {
        let started = Instant::now();
        let mut components = Vec::new();

        let report = self.registry.aggregate_health();
        let failed_critical = report.failed_critical();
        let registry_status = if !failed_critical.is_empty() {
            ProbeStatus::Fail
        } else if report
            .services
            .iter()
            .any(|s| matches!(s.state, ServiceState::Degraded | ServiceState::Failed))
        {
            ProbeStatus::Warn
        } else {
            ProbeStatus::Pass
        };
        components.push(ComponentHealth {
            name: "service_registry".to_owned(),
            status: registry_status,
            detail: (!failed_critical.is_empty())
                .then(|| format!("failed critical: {}", failed_critical.join(", "))),
        });

        components.push(ComponentHealth {
            name: "entity_discovery".to_owned(),
            status: if self.entities.is_empty() { ProbeStatus::Fail } else { ProbeStatus::Pass },
            detail: Some(format!("{} entities", self.entities.len())),
        });

        components.push(ComponentHealth {
            name: "can_interfaces".to_owned(),
            status: if self.facade.hardware_ready() { ProbeStatus::Pass } else { ProbeStatus::Fail },
            detail: None,
        });

        let protocol_ok = self.facade.statistics().pipeline_errors == 0;
        components.push(ComponentHealth {
            name: "protocol".to_owned(),
            status: if protocol_ok { ProbeStatus::Pass } else { ProbeStatus::Warn },
            detail: None,
        });

        let watchdog = self.safety.watchdog_status();
        let safety_status = if watchdog.emergency_active {
            ProbeStatus::Fail
        } else if watchdog.degraded {
            ProbeStatus::Warn
        } else {
            ProbeStatus::Pass
        };
        components.push(ComponentHealth {
            name: "safety".to_owned(),
            status: safety_status,
            detail: watchdog.emergency_active.then(|| "emergency stop active".to_owned()),
        });

        self.respond(started, components)
    }

    /// Human-readable summary. Always serves; degradation shows in the
    /// component breakdown rather than the transport status.
    pub fn health(&self) -> HealthResponse {
        let started = Instant::now();
        let report = self.registry.aggregate_health();
        let mut components: Vec<ComponentHealth> = report
            .services
            .iter()
            .map(|s| ComponentHealth {
                name: s.name.clone(),
                status: match s.state {
                    ServiceState::Healthy => ProbeStatus::Pass,
                    ServiceState::Degraded | ServiceState::Starting | ServiceState::Pending => {
                        ProbeStatus::Warn
                    }
                    ServiceState::Failed | ServiceState::Stopped => ProbeStatus::Fail,
                },
                detail: s.error.clone(),
            })
            .collect();

        let watchdog = self.safety.watchdog_status();
        components.push(ComponentHealth {
            name: "watchdog".to_owned(),
            status: if watchdog.degraded { ProbeStatus::Warn } else { ProbeStatus::Pass },
            detail: Some(format!("{} lapses", watchdog.lapses)),
        });

        let mut response = self.respond(started, components);
        // The summary endpoint itself always answers 200; the aggregate
        // status is advisory.
        if response.status == ProbeStatus::Fail {
            response.status = ProbeStatus::Warn;
        }
        response
    }
}

#[cfg(test)]
#[path = "health_tests.rs"]
mod tests;
