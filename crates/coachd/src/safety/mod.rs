// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The platform watchdog.
//!
//! Polls aggregated service health on a fixed cadence, arms a sliding
//! watchdog timer over its own loop, reacts to CRITICAL service
//! failures by coordinating a system-wide emergency stop, validates
//! operator PINs for high-impact operations, and records
//! compliance-grade audit entries for every safety transition.

pub mod interlock;
pub mod pin;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use canlink::safety::{EmergencyFlag, EmergencyOutcome, SafetyAware};

use crate::config::{EntityKind, PinClass};
use crate::error::{CoreError, CoreResult};
use crate::events::{DomainEvent, EventBus, StopOutcome};
use crate::registry::ServiceRegistry;
use crate::repository::audit::{AuditKind, SecurityAuditRepository};
use crate::safety::interlock::InterlockEngine;
use crate::safety::pin::PinManager;

/// Bound on each service's emergency-stop handler.
pub const STOP_HANDLER_TIMEOUT: Duration = Duration::from_secs(2);

/// Watchdog view for health reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchdogStatus {
    pub degraded: bool,
    pub lapses: u64,
    pub last_cycle_age_ms: u64,
    pub emergency_active: bool,
}

struct WatchdogState {
    last_cycle: Instant,
}

/// Safety orchestration service.
pub struct SafetyService {
    registry: Mutex<Option<Arc<ServiceRegistry>>>,
    targets: Mutex<Vec<Arc<dyn SafetyAware>>>,
    emergency: EmergencyFlag,
    interlocks: Arc<InterlockEngine>,
    pins: Arc<PinManager>,
    audit: Arc<SecurityAuditRepository>,
    events: EventBus,
    health_interval: Duration,
    watchdog_timeout: Duration,
    watchdog: Mutex<WatchdogState>,
    degraded: AtomicBool,
    lapses: AtomicU64,
}

impl SafetyService {
    pub fn new(
        emergency: EmergencyFlag,
        interlocks: Arc<InterlockEngine>,
        pins: Arc<PinManager>,
        audit: Arc<SecurityAuditRepository>,
        events: EventBus,
        health_interval: Duration,
        watchdog_timeout: Duration,
    ) -> Self {
        Self {
            registry: Mutex::new(None),
            targets: Mutex::new(Vec::new()),
            emergency,
            interlocks,
            pins,
            audit,
            events,
            health_interval,
            watchdog_timeout,
            watchdog: Mutex::new(WatchdogState { last_cycle: Instant::now() }),
            degraded: AtomicBool::new(false),
            lapses: AtomicU64::new(0),
        }
    }

    /// Attach the registry after both sides exist (the registry also
    /// hosts this service; attaching late avoids a construction cycle).
    pub fn attach_registry(&self, registry: Arc<ServiceRegistry>) {
        *self.registry.lock() = Some(registry);
    }

    /// Register a service into the emergency-stop cascade.
    pub fn register_target(&self, target: Arc<dyn SafetyAware>) {
        self.targets.lock().push(target);
    }

    pub fn emergency_flag(&self) -> EmergencyFlag {
        self.emergency.clone()
    }

    pub fn interlocks(&self) -> &Arc<InterlockEngine> {
        &self.interlocks
    }

    pub fn pins(&self) -> &Arc<PinManager> {
        &self.pins
    }

    pub fn is_emergency_active(&self) -> bool {
        self.emergency.is_active()
    }

    /// Fail a safety-classified operation while emergency stop is
    /// active.
    pub fn guard(&self, operation: &str) -> CoreResult<()> {
        if self.emergency.is_active() {
            let reason = self.emergency.reason().unwrap_or_else(|| "emergency stop".to_owned());
            return Err(CoreError::emergency_stop(format!("{operation} blocked: {reason}")));
        }
        Ok(())
    }

    /// Evaluate interlocks for a movement command.
    pub fn check_interlock(&self, kind: EntityKind, operation: &str) -> CoreResult<()> {
        self.guard(operation)?;
        self.interlocks.check(kind, operation)
    }

    /// Bypass an interlock under an override-class PIN session. Always
    /// audited, compliance-tagged.
    pub fn override_interlock(
        &self,
        principal: &str,
        pin_session_id: &str,
        kind: EntityKind,
        operation: &str,
    ) -> CoreResult<()> {
        let session = self.pins.authorize(pin_session_id, PinClass::Override)?;
        self.audit.append(
            AuditKind::InterlockOverride,
            Some(principal.to_owned()),
            serde_json::json!({
                "kind": kind.as_str(),
                "operation": operation,
                "pin_session": session.id,
            }),
            true,
        );
        tracing::warn!(principal, kind = kind.as_str(), operation, "interlock overridden");
        Ok(())
    }

    /// Coordinate a system-wide emergency stop.
    ///
    /// Sets the global flag (blocking all new safety operations), then
    /// invokes every registered service's `emergency_stop` in parallel
    /// under a bounded timeout, publishes completion with per-service
    /// outcomes, and writes immutable audit entries.
    pub async fn initiate_emergency_stop(&self, reason: &str) -> CoreResult<Vec<StopOutcome>> {
        if !self.emergency.set(reason) {
            return Err(CoreError::conflict("emergency stop already active"));
        }
        tracing::error!(reason, "EMERGENCY STOP initiated");
        self.events.publish(DomainEvent::EmergencyStopInitiated { reason: reason.to_owned() });
        self.audit.append(
            AuditKind::EmergencyStopInitiated,
            None,
            serde_json::json!({ "reason": reason }),
            true,
        );

        let targets: Vec<Arc<dyn SafetyAware>> = self.targets.lock().clone();
        let calls = targets.iter().map(|service| {
            let name = service.name().to_owned();
            async move {
                match tokio::time::timeout(STOP_HANDLER_TIMEOUT, service.emergency_stop(reason))
                    .await
                {
                    Ok(outcome) => (name, outcome),
                    Err(_) => (name, EmergencyOutcome::TimedOut),
                }
            }
        });
        let outcomes: Vec<StopOutcome> = futures_util::future::join_all(calls)
            .await
            .into_iter()
            .map(|(service, outcome)| StopOutcome {
                service,
                outcome: outcome.as_str().to_owned(),
            })
            .collect();

        self.events.publish(DomainEvent::EmergencyStopCompleted {
            reason: reason.to_owned(),
            outcomes: outcomes.clone(),
        });
        self.audit.append(
            AuditKind::EmergencyStopCompleted,
            None,
            serde_json::json!({
                "reason": reason,
                "outcomes": outcomes,
            }),
            true,
        );
        Ok(outcomes)
    }

    /// Clear the emergency flag.
    ///
    /// Requires an override-class PIN session and explicit confirmation;
    /// the audit trail is preserved.
    pub fn reset_emergency(
        &self,
        principal: &str,
        pin_session_id: &str,
        confirm: bool,
    ) -> CoreResult<()> {
        if !confirm {
            return Err(CoreError::invalid_input("emergency reset requires confirmation"));
        }
        let session = self.pins.authorize(pin_session_id, PinClass::Override)?;
        if !self.emergency.is_active() {
            return Err(CoreError::conflict("no emergency stop is active"));
        }
        self.emergency.clear();
        self.degraded.store(false, Ordering::Release);
        self.audit.append(
            AuditKind::EmergencyStopReset,
            Some(principal.to_owned()),
            serde_json::json!({ "pin_session": session.id }),
            true,
        );
        self.events.publish(DomainEvent::EmergencyStopReset { principal: principal.to_owned() });
        tracing::warn!(principal, "emergency stop reset");
        Ok(())
    }

    /// One watchdog cycle: run health probes, aggregate, and react to
    /// CRITICAL failures. Returns the names of failed critical services.
    pub async fn run_cycle(&self) -> Vec<String> {
        let registry = self.registry.lock().clone();
        let Some(registry) = registry else {
            return Vec::new();
        };
        registry.run_health_checks();
        let report = registry.aggregate_health();
        let failed = report.failed_critical();

        if !failed.is_empty() && !self.emergency.is_active() {
            let reason = format!("critical service failure: {}", failed.join(", "));
            if let Err(e) = self.initiate_emergency_stop(&reason).await {
                tracing::warn!(err = %e, "emergency stop raced another trigger");
            }
        }

        // A completed cycle feeds the watchdog.
        self.feed_watchdog();
        failed
    }

    /// Reset the sliding watchdog timer.
    pub fn feed_watchdog(&self) {
        self.watchdog.lock().last_cycle = Instant::now();
        if self.degraded.swap(false, Ordering::AcqRel) {
            tracing::info!("watchdog recovered");
        }
    }

    /// Check the watchdog timer; records a lapse when expired.
    pub fn check_watchdog(&self) -> bool {
        let elapsed = self.watchdog.lock().last_cycle.elapsed();
        if elapsed <= self.watchdog_timeout {
            return false;
        }
        if !self.degraded.swap(true, Ordering::AcqRel) {
            let elapsed_ms = elapsed.as_millis() as u64;
            self.lapses.fetch_add(1, Ordering::Relaxed);
            tracing::error!(elapsed_ms, "watchdog lapse: health loop missed its deadline");
            self.events.publish(DomainEvent::WatchdogLapse { elapsed_ms });
            self.audit.append(
                AuditKind::WatchdogLapse,
                None,
                serde_json::json!({ "elapsed_ms": elapsed_ms }),
                false,
            );
        }
        true
    }

    pub fn watchdog_status(&self) -> WatchdogStatus {
        WatchdogStatus {
            degraded: self.degraded.load(Ordering::Acquire),
            lapses: self.lapses.load(Ordering::Relaxed),
            last_cycle_age_ms: self.watchdog.lock().last_cycle.elapsed().as_millis() as u64,
            emergency_active: self.emergency.is_active(),
        }
    }

    /// Spawn the watchdog loop: periodic health cycles plus immediate
    /// reaction to critical-failure events.
    pub fn spawn_monitor(self: &Arc<Self>, cancel: CancellationToken) {
        let service = Arc::clone(self);
        let mut events = self.events.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(service.health_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        service.run_cycle().await;
                        service.check_watchdog();
                    }
                    event = events.recv() => {
                        match event {
                            Ok(DomainEvent::CriticalServiceFailure { service: name }) => {
                                if !service.is_emergency_active() {
                                    let reason = format!("critical service failure: {name}");
                                    if let Err(e) = service.initiate_emergency_stop(&reason).await {
                                        tracing::warn!(err = %e, "emergency stop raced another trigger");
                                    }
                                }
                            }
                            Ok(_) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                tracing::warn!("safety monitor lagged by {n} events");
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
            tracing::info!("safety monitor stopped");
        });
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
