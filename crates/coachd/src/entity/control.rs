// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Validated command dispatch and optimistic reconciliation.
//!
//! The request pipeline runs: resolve entity, verify controllability,
//! safety interlock, auth scope, encode, enqueue, track pending, apply
//! optimistic, broadcast. A pending command resolves to exactly one of
//! reconciled (bus confirmed the desired state), rolled back (deadline
//! lapsed; in-memory state reverts to the last confirmed value), or
//! superseded (a newer command took over the entity). The bus is ground
//! truth; reconciliation never forces it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use canlink::codec::Codec;
use canlink::frame::{epoch_ms, CanFrame};
use canlink::ring::Ring;
use canlink::safety::EmergencyFlag;

use crate::config::{CoachConfig, EntityDefinition, EntityKind};
use crate::entity::{EntityManager, EntityState, EntityUpdate, HvacMode, MotionState};
use crate::error::{CoreError, CoreResult};
use crate::events::{DomainEvent, EventBus};
use crate::repository::audit::{AuditKind, SecurityAuditRepository};
use crate::safety::interlock::InterlockEngine;
use crate::security::AuthContext;

/// Scope required to control entities.
pub const CONTROL_SCOPE: &str = "entity:control";

/// Completed-command history depth.
const HISTORY_CAPACITY: usize = 512;

/// Movement command for slides and awnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionCommand {
    Stop,
    Extend,
    Retract,
}

impl MotionCommand {
    fn raw(&self) -> u32 {
        match self {
            Self::Stop => 0,
            Self::Extend => 1,
            Self::Retract => 2,
        }
    }

    fn operation(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Extend => "extend",
            Self::Retract => "retract",
        }
    }
}

/// Kind-specific control action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlAction {
    Light {
        on: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        brightness: Option<f64>,
    },
    Slide { command: MotionCommand },
    Awning {
        command: MotionCommand,
        #[serde(skip_serializing_if = "Option::is_none")]
        position: Option<f64>,
    },
    Hvac {
        mode: HvacMode,
        fan_speed: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        setpoint_c: Option<f64>,
    },
    Switch { on: bool },
}

/// A control request against one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub entity_id: String,
    pub action: ControlAction,
}

/// Command lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Reconciled,
    RolledBack,
    Superseded,
}

/// Dispatch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlStats {
    pub dispatched: u64,
    pub reconciled: u64,
    pub rolled_back: u64,
    pub superseded: u64,
    /// Supersessions that landed inside the debounce window (rapid
    /// double-taps rather than deliberate re-commands).
    pub superseded_within_debounce: u64,
}

/// A tracked control command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub entity_id: String,
    pub desired: EntityState,
    pub principal: String,
    pub issued_ms: u64,
    pub deadline_ms: u64,
    pub status: CommandStatus,
}

/// Validated command dispatch over the entity map.
pub struct ControlService {
    entities: Arc<EntityManager>,
    interlocks: Arc<InterlockEngine>,
    emergency: EmergencyFlag,
    codec: Codec,
    transmit: mpsc::Sender<CanFrame>,
    events: EventBus,
    audit: Arc<SecurityAuditRepository>,
    config: Arc<CoachConfig>,
    default_deadline: Duration,
    debounce: Duration,
    pending: Mutex<HashMap<String, Command>>,
    history: Mutex<Ring<Command>>,
    stats: Mutex<ControlStats>,
    repository: Mutex<Option<Arc<crate::repository::entity::EntityRepository>>>,
}

impl ControlService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        entities: Arc<EntityManager>,
        interlocks: Arc<InterlockEngine>,
        emergency: EmergencyFlag,
        codec: Codec,
        transmit: mpsc::Sender<CanFrame>,
        events: EventBus,
        audit: Arc<SecurityAuditRepository>,
        config: Arc<CoachConfig>,
        default_deadline: Duration,
        debounce: Duration,
    ) -> Self {
        Self {
            entities,
            interlocks,
            emergency,
            codec,
            transmit,
            events,
            audit,
            config,
            default_deadline,
            debounce,
            pending: Mutex::new(HashMap::new()),
            history: Mutex::new(Ring::new(HISTORY_CAPACITY)),
            stats: Mutex::new(ControlStats::default()),
            repository: Mutex::new(None),
        }
    }

    /// Attach the entity repository so completed commands land in the
    /// persistent command audit.
    pub fn attach_repository(&self, repository: Arc<crate::repository::entity::EntityRepository>) {
        *self.repository.lock() = Some(repository);
    }

    fn log_completed(&self, command: Command) {
        if let Some(repository) = self.repository.lock().clone() {
            repository.record_command(command.clone());
        }
        self.history.lock().push(command);
    }

    /// Run one control request through the full pipeline.
    pub fn control(&self, auth: &AuthContext, request: ControlRequest) -> CoreResult<Command> {
        if self.emergency.is_active() {
            return Err(CoreError::emergency_stop("entity control blocked by emergency stop"));
        }

        let entity = self.entities.get(&request.entity_id)?;
        if !entity.controllable() {
            return Err(CoreError::conflict(format!(
                "entity {} has no controller",
                request.entity_id
            )));
        }

        let operation = action_operation(&request.action);
        if let Err(err) = self.interlocks.check(entity.kind, operation) {
            self.audit.append(
                AuditKind::EntityControlBlocked,
                Some(auth.principal.clone()),
                serde_json::json!({
                    "entity_id": request.entity_id,
                    "operation": operation,
                    "reason": err.message,
                }),
                false,
            );
            self.events.publish(DomainEvent::EntityControlBlocked {
                entity_id: request.entity_id.clone(),
                reason: err.message.clone(),
            });
            return Err(err);
        }

        if !auth.has_scope(CONTROL_SCOPE) {
            self.audit.append(
                AuditKind::EntityControlBlocked,
                Some(auth.principal.clone()),
                serde_json::json!({
                    "entity_id": request.entity_id,
                    "reason": "missing_scope",
                }),
                false,
            );
            return Err(CoreError::forbidden(format!(
                "principal {} lacks {CONTROL_SCOPE}",
                auth.principal
            )));
        }

        let desired = desired_state(&entity.state, &request.action);
        let frame = self.encode_command(&entity.definition, &request.action, &desired)?;
        self.transmit.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => CoreError::queue_full("transmit queue saturated"),
            mpsc::error::TrySendError::Closed(_) => CoreError::internal("transmit queue closed"),
        })?;

        let now = epoch_ms();
        let deadline =
            self.config.reconcile_deadline(entity.kind, self.default_deadline);
        let command = Command {
            id: Uuid::new_v4().to_string(),
            entity_id: request.entity_id.clone(),
            desired: desired.clone(),
            principal: auth.principal.clone(),
            issued_ms: now,
            deadline_ms: now + deadline.as_millis() as u64,
            status: CommandStatus::Pending,
        };

        // A subsequent command supersedes any pending one on the entity;
        // its frame already went out, only the latest is tracked.
        if let Some(mut previous) =
            self.pending.lock().insert(request.entity_id.clone(), command.clone())
        {
            previous.status = CommandStatus::Superseded;
            let gap = now.saturating_sub(previous.issued_ms);
            {
                let mut stats = self.stats.lock();
                stats.superseded += 1;
                if gap < self.debounce.as_millis() as u64 {
                    stats.superseded_within_debounce += 1;
                }
            }
            tracing::debug!(command = %previous.id, entity = %previous.entity_id, gap_ms = gap, "command superseded");
            self.events.publish(DomainEvent::CommandSuperseded {
                command_id: previous.id.clone(),
                entity_id: previous.entity_id.clone(),
            });
            self.log_completed(previous);
        }
        self.stats.lock().dispatched += 1;

        self.entities.apply_optimistic(&request.entity_id, desired)?;
        tracing::info!(
            command = %command.id,
            entity = %command.entity_id,
            principal = %command.principal,
            "control command dispatched"
        );
        Ok(command)
    }

    fn encode_command(
        &self,
        definition: &EntityDefinition,
        action: &ControlAction,
        desired: &EntityState,
    ) -> CoreResult<CanFrame> {
        let dgn = definition
            .command_dgn
            .ok_or_else(|| CoreError::conflict(format!("entity {} has no controller", definition.id)))?;
        let instance = definition.instance as u32;

        let values: Vec<(&str, u32)> = match (action, desired) {
            (ControlAction::Light { .. }, EntityState::Light { brightness, .. }) => {
                let raw = (brightness / 0.4).round() as u32;
                vec![("instance", instance), ("brightness", raw), ("command", 0)]
            }
            (ControlAction::Switch { on }, _) => {
                let raw = if *on { 250 } else { 0 };
                vec![("instance", instance), ("brightness", raw), ("command", 0)]
            }
            (ControlAction::Slide { command }, _) => {
                vec![("instance", instance), ("command", command.raw())]
            }
            (ControlAction::Awning { command, .. }, EntityState::Awning { position, .. }) => {
                let raw = (position / 0.4).round() as u32;
                vec![("instance", instance), ("command", command.raw()), ("position", raw)]
            }
            (
                ControlAction::Hvac { mode, fan_speed, setpoint_c },
                _,
            ) => {
                let mut values = vec![
                    ("instance", instance),
                    ("mode", hvac_mode_raw(*mode)),
                    ("fan_speed", *fan_speed as u32),
                ];
                if let Some(setpoint) = setpoint_c {
                    let raw = ((setpoint + 273.15) / 0.03125).round() as u32;
                    values.push(("setpoint_heat", raw));
                    values.push(("setpoint_cool", raw));
                }
                values
            }
            _ => {
                return Err(CoreError::invalid_input(format!(
                    "action does not fit entity kind {}",
                    definition.kind.as_str()
                )))
            }
        };

        self.codec
            .encode_raw(&definition.interface, dgn, &values, None, canlink::codec::DEFAULT_SOURCE_ADDRESS, canlink::codec::BROADCAST_ADDRESS)
            .map_err(CoreError::from)
    }

    /// Reconcile pending commands against an accepted entity update.
    pub fn on_entity_update(&self, update: &EntityUpdate) {
        let command = {
            let mut pending = self.pending.lock();
            let Some(command) = pending.get(&update.entity_id) else {
                return;
            };
            if !command.desired.matches(&update.state) {
                return;
            }
            let mut command = match pending.remove(&update.entity_id) {
                Some(command) => command,
                None => return,
            };
            command.status = CommandStatus::Reconciled;
            command
        };
        self.stats.lock().reconciled += 1;
        tracing::info!(command = %command.id, entity = %command.entity_id, "command reconciled");
        self.events.publish(DomainEvent::CommandConfirmed {
            command_id: command.id.clone(),
            entity_id: command.entity_id.clone(),
        });
        self.log_completed(command);
    }

    /// Roll back every pending command whose deadline has lapsed.
    pub fn sweep_deadlines(&self, now_ms: u64) -> usize {
        let expired: Vec<Command> = {
            let mut pending = self.pending.lock();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, c)| c.deadline_ms <= now_ms)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };

        let count = expired.len();
        self.stats.lock().rolled_back += count as u64;
        for mut command in expired {
            command.status = CommandStatus::RolledBack;
            if let Err(e) = self.entities.revert_to_confirmed(&command.entity_id) {
                tracing::warn!(entity = %command.entity_id, err = %e, "rollback revert failed");
            }
            tracing::warn!(command = %command.id, entity = %command.entity_id, "command rolled back");
            self.events.publish(DomainEvent::CommandRolledBack {
                command_id: command.id.clone(),
                entity_id: command.entity_id.clone(),
            });
            self.log_completed(command);
        }
        count
    }

    /// Spawn the deadline sweeper task.
    pub fn spawn_reconciler(self: &Arc<Self>, cancel: CancellationToken) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(50));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                service.sweep_deadlines(epoch_ms());
            }
        });
    }

    /// Look up a command by id across pending and recent history.
    pub fn command(&self, id: &str) -> Option<Command> {
        if let Some(command) = self.pending.lock().values().find(|c| c.id == id) {
            return Some(command.clone());
        }
        self.history.lock().iter().find(|c| c.id == id).cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Recently completed commands, oldest first.
    pub fn recent(&self) -> Vec<Command> {
        self.history.lock().snapshot()
    }

    pub fn statistics(&self) -> ControlStats {
        *self.stats.lock()
    }
}

fn action_operation(action: &ControlAction) -> &'static str {
    match action {
        ControlAction::Light { .. } => "set",
        ControlAction::Switch { .. } => "set",
        ControlAction::Slide { command } => command.operation(),
        ControlAction::Awning { command, .. } => command.operation(),
        ControlAction::Hvac { .. } => "set",
    }
}

fn hvac_mode_raw(mode: HvacMode) -> u32 {
    match mode {
        HvacMode::Off => 0,
        HvacMode::Heat => 1,
        HvacMode::Cool => 2,
        HvacMode::Auto => 3,
        HvacMode::FanOnly => 4,
    }
}

/// Desired end state for an action, given the current state.
fn desired_state(current: &EntityState, action: &ControlAction) -> EntityState {
    match action {
        ControlAction::Light { on, brightness } => {
            let brightness = if *on { brightness.unwrap_or(100.0) } else { 0.0 };
            EntityState::Light { on: *on, brightness }
        }
        ControlAction::Slide { command } => {
            let position = match command {
                MotionCommand::Extend => 100.0,
                MotionCommand::Retract => 0.0,
                MotionCommand::Stop => match current {
                    EntityState::Slide { position, .. } => *position,
                    _ => 0.0,
                },
            };
            EntityState::Slide { position, motion: MotionState::Stopped }
        }
        ControlAction::Awning { command, position } => {
            let position = match command {
                MotionCommand::Extend => position.unwrap_or(100.0),
                MotionCommand::Retract => 0.0,
                MotionCommand::Stop => match current {
                    EntityState::Awning { position, .. } => *position,
                    _ => 0.0,
                },
            };
            EntityState::Awning { position, motion: MotionState::Stopped }
        }
        ControlAction::Hvac { mode, fan_speed, setpoint_c } => EntityState::Hvac {
            mode: *mode,
            fan_speed: *fan_speed,
            ambient_c: match current {
                EntityState::Hvac { ambient_c, .. } => *ambient_c,
                _ => None,
            },
            setpoint_c: *setpoint_c,
        },
        ControlAction::Switch { on } => EntityState::Switch { on: *on },
    }
}

#[cfg(test)]
#[path = "control_tests.rs"]
mod tests;
