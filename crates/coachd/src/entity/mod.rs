// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Authoritative entity model.
//!
//! Entities are created once from the coach mapping, mutated only by the
//! control service (optimistic updates) and by decoded bus traffic
//! (ground truth), and destroyed only by explicit management operations.
//! `last_update` is monotonically non-decreasing per entity; a decoded
//! frame older than the current state is discarded.

pub mod control;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use canlink::frame::{epoch_ms, DecodedFrame};

use crate::config::{EntityDefinition, EntityKind};
use crate::error::{CoreError, CoreResult};
use crate::events::{DomainEvent, EventBus};

/// Motion state of slides and awnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionState {
    Stopped,
    Extending,
    Retracting,
}

impl MotionState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Extending,
            2 => Self::Retracting,
            _ => Self::Stopped,
        }
    }
}

/// HVAC operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HvacMode {
    Off,
    Heat,
    Cool,
    Auto,
    FanOnly,
}

impl HvacMode {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Heat,
            2 => Self::Cool,
            3 => Self::Auto,
            4 => Self::FanOnly,
            _ => Self::Off,
        }
    }
}

/// Kind-specific observable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityState {
    Light { on: bool, brightness: f64 },
    Slide { position: f64, motion: MotionState },
    Awning { position: f64, motion: MotionState },
    Tank { level: f64, capacity_l: Option<f64> },
    Hvac { mode: HvacMode, fan_speed: u8, ambient_c: Option<f64>, setpoint_c: Option<f64> },
    Switch { on: bool },
    Sensor { value: Option<f64> },
}

impl EntityState {
    /// Neutral initial state for a kind, used until the bus reports.
    pub fn initial(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Light => Self::Light { on: false, brightness: 0.0 },
            EntityKind::Slide => Self::Slide { position: 0.0, motion: MotionState::Stopped },
            EntityKind::Awning => Self::Awning { position: 0.0, motion: MotionState::Stopped },
            EntityKind::Tank => Self::Tank { level: 0.0, capacity_l: None },
            EntityKind::Hvac => Self::Hvac {
                mode: HvacMode::Off,
                fan_speed: 0,
                ambient_c: None,
                setpoint_c: None,
            },
            EntityKind::Switch => Self::Switch { on: false },
            EntityKind::Sensor => Self::Sensor { value: None },
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Light { .. } => EntityKind::Light,
            Self::Slide { .. } => EntityKind::Slide,
            Self::Awning { .. } => EntityKind::Awning,
            Self::Tank { .. } => EntityKind::Tank,
            Self::Hvac { .. } => EntityKind::Hvac,
            Self::Switch { .. } => EntityKind::Switch,
            Self::Sensor { .. } => EntityKind::Sensor,
        }
    }

    /// Whether an observed state satisfies this desired state.
    ///
    /// Scalar fields compare with a small tolerance (the bus quantizes
    /// percentages to 0.4 steps); motion fields are ignored for position
    /// targets since a device briefly in motion still converges.
    pub fn matches(&self, observed: &EntityState) -> bool {
        const EPS: f64 = 0.5;
        match (self, observed) {
            (Self::Light { on: a, brightness: ab }, Self::Light { on: b, brightness: bb }) => {
                a == b && (ab - bb).abs() <= EPS
            }
            (Self::Slide { position: a, .. }, Self::Slide { position: b, .. }) => {
                (a - b).abs() <= EPS
            }
            (Self::Awning { position: a, .. }, Self::Awning { position: b, .. }) => {
                (a - b).abs() <= EPS
            }
            (Self::Tank { level: a, .. }, Self::Tank { level: b, .. }) => (a - b).abs() <= EPS,
            (
                Self::Hvac { mode: am, fan_speed: af, setpoint_c: asp, .. },
                Self::Hvac { mode: bm, fan_speed: bf, setpoint_c: bsp, .. },
            ) => {
                am == bm
                    && af == bf
                    && match (asp, bsp) {
                        (Some(a), Some(b)) => (a - b).abs() <= EPS,
                        (None, _) => true,
                        (Some(_), None) => false,
                    }
            }
            (Self::Switch { on: a }, Self::Switch { on: b }) => a == b,
            (Self::Sensor { value: a }, Self::Sensor { value: b }) => a == b,
            _ => false,
        }
    }
}

/// A coach device with its current state and attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub kind: EntityKind,
    pub state: EntityState,
    /// Last state confirmed by the bus (rollback target).
    pub confirmed_state: EntityState,
    /// Epoch ms of the most recent accepted update.
    pub last_update_ms: u64,
    pub definition: EntityDefinition,
}

impl Entity {
    fn from_definition(definition: EntityDefinition) -> Self {
        let state = EntityState::initial(definition.kind);
        Self {
            id: definition.id.clone(),
            kind: definition.kind,
            state: state.clone(),
            confirmed_state: state,
            last_update_ms: 0,
            definition,
        }
    }

    pub fn controllable(&self) -> bool {
        self.definition.controllable()
    }
}

/// An accepted entity update, handed to the control service for
/// reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityUpdate {
    pub entity_id: String,
    pub state: EntityState,
    pub timestamp_ms: u64,
}

/// Owner of the authoritative entity map.
pub struct EntityManager {
    entities: RwLock<HashMap<String, Entity>>,
    /// (status DGN, instance) -> entity id routing for decoded frames.
    by_address: HashMap<(u32, u8), String>,
    events: EventBus,
    stale_discards: AtomicU64,
}

impl EntityManager {
    pub fn new(mapping: &[EntityDefinition], events: EventBus) -> Self {
        let mut entities = HashMap::new();
        let mut by_address = HashMap::new();
        for definition in mapping {
            by_address.insert((definition.status_dgn, definition.instance), definition.id.clone());
            entities.insert(definition.id.clone(), Entity::from_definition(definition.clone()));
        }
        tracing::info!(entities = entities.len(), "entity map loaded from coach mapping");
        Self { entities: RwLock::new(entities), by_address, events, stale_discards: AtomicU64::new(0) }
    }

    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }

    /// Entity ids in the map.
    pub fn ids(&self) -> Vec<String> {
        self.entities.read().keys().cloned().collect()
    }

    pub fn list(&self) -> Vec<Entity> {
        let mut entities: Vec<Entity> = self.entities.read().values().cloned().collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        entities
    }

    pub fn get(&self, id: &str) -> CoreResult<Entity> {
        self.entities
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("entity {id} does not exist")))
    }

    /// Remove an entity (management operation only).
    pub fn remove(&self, id: &str) -> CoreResult<Entity> {
        self.entities
            .write()
            .remove(id)
            .ok_or_else(|| CoreError::not_found(format!("entity {id} does not exist")))
    }

    /// Decoded updates discarded for arriving out of order.
    pub fn stale_discards(&self) -> u64 {
        self.stale_discards.load(Ordering::Relaxed)
    }

    /// Apply a decoded status frame to the entity it addresses.
    ///
    /// Returns the accepted update, or `None` when the frame addresses
    /// no known entity, carries no state, or is older than the current
    /// state (monotonic guard).
    pub fn apply_decoded(&self, frame: &DecodedFrame) -> Option<EntityUpdate> {
        let pgn = frame.pgn?;
        let instance = frame.raw("instance").unwrap_or(0).min(u8::MAX as u32) as u8;
        let entity_id = self.by_address.get(&(pgn, instance))?.clone();

        let mut entities = self.entities.write();
        let entity = entities.get_mut(&entity_id)?;
        if frame.frame.timestamp_ms < entity.last_update_ms {
            self.stale_discards.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(entity = %entity_id, "discarding stale decoded update");
            return None;
        }

        let state = decode_state(entity.kind, &entity.state, frame)?;
        entity.state = state.clone();
        entity.confirmed_state = state.clone();
        entity.last_update_ms = frame.frame.timestamp_ms;
        drop(entities);

        let update =
            EntityUpdate { entity_id: entity_id.clone(), state, timestamp_ms: frame.frame.timestamp_ms };
        self.events.publish(DomainEvent::EntityUpdated {
            entity_id,
            state: update.state.clone(),
            timestamp_ms: update.timestamp_ms,
            confirmed: true,
        });
        Some(update)
    }

    /// Apply an optimistic state ahead of bus confirmation.
    pub fn apply_optimistic(&self, id: &str, state: EntityState) -> CoreResult<()> {
        let now = epoch_ms();
        {
            let mut entities = self.entities.write();
            let entity = entities
                .get_mut(id)
                .ok_or_else(|| CoreError::not_found(format!("entity {id} does not exist")))?;
            entity.state = state.clone();
            entity.last_update_ms = entity.last_update_ms.max(now);
        }
        self.events.publish(DomainEvent::EntityUpdated {
            entity_id: id.to_owned(),
            state,
            timestamp_ms: now,
            confirmed: false,
        });
        Ok(())
    }

    /// Revert an entity to its last bus-confirmed state (rollback path).
    pub fn revert_to_confirmed(&self, id: &str) -> CoreResult<EntityState> {
        let state = {
            let mut entities = self.entities.write();
            let entity = entities
                .get_mut(id)
                .ok_or_else(|| CoreError::not_found(format!("entity {id} does not exist")))?;
            entity.state = entity.confirmed_state.clone();
            entity.state.clone()
        };
        Ok(state)
    }
}

/// Build a kind-specific state from a decoded status frame, falling back
/// to the current state's fields for anything the frame does not carry.
fn decode_state(kind: EntityKind, current: &EntityState, frame: &DecodedFrame) -> Option<EntityState> {
    match kind {
        EntityKind::Light => {
            let brightness = frame.value("brightness")?;
            Some(EntityState::Light { on: brightness > 0.0, brightness })
        }
        EntityKind::Slide => {
            let position = frame.value("position")?;
            let motion = MotionState::from_raw(frame.raw("motion").unwrap_or(0));
            Some(EntityState::Slide { position, motion })
        }
        EntityKind::Awning => {
            let position = frame.value("position")?;
            let motion = MotionState::from_raw(frame.raw("motion").unwrap_or(0));
            Some(EntityState::Awning { position, motion })
        }
        EntityKind::Tank => {
            let level = frame.value("level")?;
            let capacity_l = frame.value("capacity");
            Some(EntityState::Tank { level, capacity_l })
        }
        EntityKind::Hvac => {
            let mode = HvacMode::from_raw(frame.raw("mode").unwrap_or(0));
            let fan_speed = frame.raw("fan_speed").unwrap_or(0).min(u8::MAX as u32) as u8;
            let ambient_c = frame.value("ambient");
            let setpoint_c = frame.value("setpoint").or(match current {
                EntityState::Hvac { setpoint_c, .. } => *setpoint_c,
                _ => None,
            });
            Some(EntityState::Hvac { mode, fan_speed, ambient_c, setpoint_c })
        }
        EntityKind::Switch => {
            let on = frame
                .value("brightness")
                .map(|b| b > 0.0)
                .or_else(|| frame.raw("status").map(|s| s > 0))?;
            Some(EntityState::Switch { on })
        }
        EntityKind::Sensor => {
            let value = frame.fields.iter().find(|f| f.valid && f.value.is_some())?.value;
            Some(EntityState::Sensor { value })
        }
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
