// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared domain event bus.
//!
//! One in-process broadcast channel carries every domain event: entity
//! updates, command lifecycle, service health transitions, security
//! threats, and the emergency-stop protocol. Fan-out is best-effort in
//! publish order; a subscriber that lags past its buffer observes
//! `Lagged` and misses events rather than blocking publishers. The bus
//! is deliberately single-process; a multi-process deployment needs an
//! external broker.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::entity::EntityState;
use crate::registry::ServiceState;
use crate::security::ThreatSeverity;

/// Per-service outcome reported in `EmergencyStopCompleted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopOutcome {
    pub service: String,
    pub outcome: String,
}

/// Every cross-component event in the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    /// An entity changed state. `confirmed` distinguishes bus ground
    /// truth from optimistic control-service updates.
    EntityUpdated { entity_id: String, state: EntityState, timestamp_ms: u64, confirmed: bool },
    /// A pending command was confirmed by the bus.
    CommandConfirmed { command_id: String, entity_id: String },
    /// A pending command missed its deadline and was rolled back.
    CommandRolledBack { command_id: String, entity_id: String },
    /// A pending command was superseded by a newer one.
    CommandSuperseded { command_id: String, entity_id: String },
    /// A control request was refused before any frame was emitted.
    EntityControlBlocked { entity_id: String, reason: String },
    /// A registered service changed lifecycle state.
    ServiceStateChanged { service: String, prev: ServiceState, next: ServiceState },
    /// A CRITICAL service left HEALTHY for FAILED.
    CriticalServiceFailure { service: String },
    /// The anomaly detector flagged suspicious bus traffic.
    AnomalyDetected {
        kind: String,
        severity: ThreatSeverity,
        #[serde(skip_serializing_if = "Option::is_none")]
        can_id: Option<u32>,
        interface: String,
        detail: String,
    },
    /// The security orchestrator flagged a suspicious pattern.
    SecurityThreat {
        severity: ThreatSeverity,
        pattern: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        principal: Option<String>,
        safety_endpoint: bool,
    },
    /// Emergency stop began.
    EmergencyStopInitiated { reason: String },
    /// Emergency stop finished; one outcome per safety-aware service.
    EmergencyStopCompleted { reason: String, outcomes: Vec<StopOutcome> },
    /// An operator reset the emergency flag.
    EmergencyStopReset { principal: String },
    /// The safety watchdog missed its deadline.
    WatchdogLapse { elapsed_ms: u64 },
}

/// Cloneable handle onto the domain event bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Never blocks; an event with no subscribers is
    /// simply dropped.
    pub fn publish(&self, event: DomainEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(512)
    }
}
