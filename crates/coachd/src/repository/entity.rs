// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Entity configuration, state snapshots, and per-entity history.
//!
//! Snapshots carry monotonic timestamps; a write older than the stored
//! snapshot is rejected. History is append-only per entity with a
//! retention window.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::{EntityDefinition, RetentionPolicy};
use crate::entity::EntityState;
use crate::error::{CoreError, CoreResult};
use crate::monitor::PerfMonitor;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// A timestamped entity state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub entity_id: String,
    pub state: EntityState,
    pub timestamp_ms: u64,
}

/// Store for entity configuration and observed state.
pub struct EntityRepository {
    monitor: PerfMonitor,
    retention: RetentionPolicy,
    definitions: Mutex<HashMap<String, EntityDefinition>>,
    latest: Mutex<HashMap<String, StateSnapshot>>,
    history: Mutex<HashMap<String, Vec<StateSnapshot>>>,
    command_log: Mutex<HashMap<String, Vec<crate::entity::control::Command>>>,
}

impl EntityRepository {
    pub fn new(monitor: PerfMonitor, retention: RetentionPolicy) -> Self {
        Self {
            monitor,
            retention,
            definitions: Mutex::new(HashMap::new()),
            latest: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            command_log: Mutex::new(HashMap::new()),
        }
    }

    pub fn upsert_definition(&self, definition: EntityDefinition) {
        self.monitor.time("entity_repo.upsert_definition", || {
            self.definitions.lock().insert(definition.id.clone(), definition);
        })
    }

    pub fn definition(&self, id: &str) -> Option<EntityDefinition> {
        self.monitor.time("entity_repo.definition", || self.definitions.lock().get(id).cloned())
    }

    pub fn definitions(&self) -> Vec<EntityDefinition> {
        self.monitor.time("entity_repo.definitions", || {
            let mut defs: Vec<EntityDefinition> =
                self.definitions.lock().values().cloned().collect();
            defs.sort_by(|a, b| a.id.cmp(&b.id));
            defs
        })
    }

    /// Record a state snapshot. Rejects writes older than the stored one.
    pub fn record_state(&self, snapshot: StateSnapshot) -> CoreResult<()> {
        self.monitor.time_result("entity_repo.record_state", || {
            {
                let mut latest = self.latest.lock();
                if let Some(existing) = latest.get(&snapshot.entity_id) {
                    if snapshot.timestamp_ms < existing.timestamp_ms {
                        return Err(CoreError::conflict(format!(
                            "snapshot for {} is older than stored state",
                            snapshot.entity_id
                        )));
                    }
                }
                latest.insert(snapshot.entity_id.clone(), snapshot.clone());
            }
            self.history.lock().entry(snapshot.entity_id.clone()).or_default().push(snapshot);
            Ok(())
        })
    }

    pub fn latest(&self, id: &str) -> Option<StateSnapshot> {
        self.monitor.time("entity_repo.latest", || self.latest.lock().get(id).cloned())
    }

    /// History for one entity at or after `since_ms`, oldest first.
    pub fn history(&self, id: &str, since_ms: u64) -> Vec<StateSnapshot> {
        self.monitor.time("entity_repo.history", || {
            self.history
                .lock()
                .get(id)
                .map(|entries| {
                    entries.iter().filter(|s| s.timestamp_ms >= since_ms).cloned().collect()
                })
                .unwrap_or_default()
        })
    }

    /// Append a completed command to the per-entity audit log.
    pub fn record_command(&self, command: crate::entity::control::Command) {
        self.monitor.time("entity_repo.record_command", || {
            self.command_log
                .lock()
                .entry(command.entity_id.clone())
                .or_default()
                .push(command);
        })
    }

    /// Command audit for one entity at or after `since_ms`, oldest
    /// first.
    pub fn commands(&self, id: &str, since_ms: u64) -> Vec<crate::entity::control::Command> {
        self.monitor.time("entity_repo.commands", || {
            self.command_log
                .lock()
                .get(id)
                .map(|entries| entries.iter().filter(|c| c.issued_ms >= since_ms).cloned().collect())
                .unwrap_or_default()
        })
    }

    /// Drop history entries past the retention window.
    pub fn prune_history(&self, now_ms: u64) -> usize {
        self.monitor.time("entity_repo.prune_history", || {
            let cutoff = now_ms.saturating_sub(self.retention.history_days as u64 * DAY_MS);
            let mut removed = 0;
            let mut history = self.history.lock();
            for entries in history.values_mut() {
                let before = entries.len();
                entries.retain(|s| s.timestamp_ms >= cutoff);
                removed += before - entries.len();
            }
            removed
        })
    }
}

#[cfg(test)]
#[path = "entity_tests.rs"]
mod tests;
