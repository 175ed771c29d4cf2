// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dependency-ordered service lifecycle kernel.
//!
//! Services register with an init function, a dependency list, and a
//! safety classification. The registry rejects duplicate names and any
//! edge that would close a cycle, computes startup stages by
//! longest-path-from-leaf, initializes each stage in parallel under a
//! bounded timeout, and shuts down in reverse topological order. It is
//! the sole owner of service instances; lookups hand out shared handles.

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use canlink::safety::{EmergencyAction, SafetyClassification};

use crate::error::{CoreError, CoreResult};
use crate::events::{DomainEvent, EventBus};

/// Opaque service instance owned by the registry.
pub type ServiceInstance = Arc<dyn Any + Send + Sync>;

/// Dependencies resolved for an init function. A key maps to `None`
/// when an OPTIONAL dependency failed to start.
pub type DepMap = HashMap<String, Option<ServiceInstance>>;

/// Service init thunk, run once during startup.
pub type InitFn =
    Box<dyn FnOnce(DepMap) -> BoxFuture<'static, anyhow::Result<ServiceInstance>> + Send>;

/// Health probe over a running instance.
pub type HealthFn = Arc<dyn Fn(&ServiceInstance) -> bool + Send + Sync>;

/// Shutdown hook over a running instance.
pub type ShutdownFn =
    Arc<dyn Fn(ServiceInstance) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Lifecycle state of a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Pending,
    Starting,
    Healthy,
    Degraded,
    Failed,
    Stopped,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

/// Dependency strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    Required,
    Optional,
}

/// One declared dependency edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDependency {
    pub name: String,
    pub kind: DependencyKind,
}

/// Registration spec, built fluently and consumed by
/// [`ServiceRegistry::register`].
pub struct ServiceSpec {
    name: String,
    init: InitFn,
    deps: Vec<ServiceDependency>,
    classification: SafetyClassification,
    emergency_action: EmergencyAction,
    tags: HashSet<String>,
    health: Option<HealthFn>,
    shutdown: Option<ShutdownFn>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, init: InitFn) -> Self {
        Self {
            name: name.into(),
            init,
            deps: Vec::new(),
            classification: SafetyClassification::Operational,
            emergency_action: EmergencyAction::ContinueOperation,
            tags: HashSet::new(),
            health: None,
            shutdown: None,
        }
    }

    pub fn requires(mut self, name: impl Into<String>) -> Self {
        self.deps.push(ServiceDependency { name: name.into(), kind: DependencyKind::Required });
        self
    }

    pub fn optional(mut self, name: impl Into<String>) -> Self {
        self.deps.push(ServiceDependency { name: name.into(), kind: DependencyKind::Optional });
        self
    }

    pub fn classification(mut self, classification: SafetyClassification) -> Self {
        self.classification = classification;
        self
    }

    pub fn emergency_action(mut self, action: EmergencyAction) -> Self {
        self.emergency_action = action;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn health(mut self, health: impl Fn(&ServiceInstance) -> bool + Send + Sync + 'static) -> Self {
        self.health = Some(Arc::new(health));
        self
    }

    pub fn shutdown(
        mut self,
        shutdown: impl Fn(ServiceInstance) -> BoxFuture<'static, anyhow::Result<()>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.shutdown = Some(Arc::new(shutdown));
        self
    }
}

/// Public view of one registered service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceView {
    pub name: String,
    pub state: ServiceState,
    pub classification: SafetyClassification,
    pub emergency_action: EmergencyAction,
    pub deps: Vec<ServiceDependency>,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup_ms: Option<u64>,
}

/// Aggregated health over every registered service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub services: Vec<ServiceView>,
    pub counts: HashMap<String, usize>,
    /// Wall-clock per startup stage, in order.
    pub stage_latencies_ms: Vec<u64>,
    /// Service names by startup latency, slowest first.
    pub slowest_services: Vec<String>,
    pub startup_errors: usize,
}

impl HealthReport {
    pub fn all_healthy(&self) -> bool {
        self.services.iter().all(|s| s.state == ServiceState::Healthy)
    }

    /// Names of CRITICAL services currently failed.
    pub fn failed_critical(&self) -> Vec<String> {
        self.services
            .iter()
            .filter(|s| {
                s.classification == SafetyClassification::Critical
                    && s.state == ServiceState::Failed
            })
            .map(|s| s.name.clone())
            .collect()
    }
}

struct NodeSlot {
    deps: Vec<ServiceDependency>,
    classification: SafetyClassification,
    emergency_action: EmergencyAction,
    tags: HashSet<String>,
    state: ServiceState,
    error: Option<String>,
    startup_ms: Option<u64>,
    init: Option<InitFn>,
    health: Option<HealthFn>,
    shutdown: Option<ShutdownFn>,
    instance: Option<ServiceInstance>,
}

/// The lifecycle kernel.
pub struct ServiceRegistry {
    nodes: Mutex<IndexMap<String, NodeSlot>>,
    events: EventBus,
    startup_timeout: Duration,
    shutdown_timeout: Duration,
    stage_latencies: Mutex<Vec<u64>>,
}

impl ServiceRegistry {
    pub fn new(events: EventBus, startup_timeout: Duration, shutdown_timeout: Duration) -> Self {
        Self {
            nodes: Mutex::new(IndexMap::new()),
            events,
            startup_timeout,
            shutdown_timeout,
            stage_latencies: Mutex::new(Vec::new()),
        }
    }

    /// Register a service.
    ///
    /// Fails on a duplicate name or when the new edges would close a
    /// dependency cycle; a rejected registration leaves the graph
    /// untouched.
    pub fn register(&self, spec: ServiceSpec) -> CoreResult<()> {
        let mut nodes = self.nodes.lock();
        if nodes.contains_key(&spec.name) {
            return Err(CoreError::conflict(format!("duplicate service {}", spec.name)));
        }

        // Kahn-style cycle check over the graph including the new node.
        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut indegree: HashMap<&str, usize> = HashMap::new();
        let known: HashSet<&str> = nodes
            .keys()
            .map(String::as_str)
            .chain(std::iter::once(spec.name.as_str()))
            .collect();
        for name in &known {
            indegree.entry(*name).or_insert(0);
        }

        let mut all_edges: Vec<(String, String)> = Vec::new();
        for (name, slot) in nodes.iter() {
            for dep in &slot.deps {
                if known.contains(dep.name.as_str()) {
                    all_edges.push((dep.name.clone(), name.clone()));
                }
            }
        }
        for dep in &spec.deps {
            if dep.name == spec.name {
                return Err(CoreError::circular_dependency(format!(
                    "service {} depends on itself",
                    spec.name
                )));
            }
            if known.contains(dep.name.as_str()) {
                all_edges.push((dep.name.clone(), spec.name.clone()));
            }
        }
        for (from, to) in &all_edges {
            edges.entry(from.as_str()).or_default().push(to.as_str());
            *indegree.entry(to.as_str()).or_insert(0) += 1;
        }
        let mut queue: VecDeque<&str> =
            indegree.iter().filter(|(_, &d)| d == 0).map(|(&n, _)| n).collect();
        let mut visited = 0usize;
        while let Some(node) = queue.pop_front() {
            visited += 1;
            for &next in edges.get(node).into_iter().flatten() {
                let d = indegree.entry(next).or_insert(0);
                *d -= 1;
                if *d == 0 {
                    queue.push_back(next);
                }
            }
        }
        if visited != known.len() {
            return Err(CoreError::circular_dependency(format!(
                "registering {} would close a dependency cycle",
                spec.name
            )));
        }

        nodes.insert(
            spec.name.clone(),
            NodeSlot {
                deps: spec.deps,
                classification: spec.classification,
                emergency_action: spec.emergency_action,
                tags: spec.tags,
                state: ServiceState::Pending,
                error: None,
                startup_ms: None,
                init: Some(spec.init),
                health: spec.health,
                shutdown: spec.shutdown,
                instance: None,
            },
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }

    /// Startup stages by longest path from a leaf; unregistered
    /// dependencies contribute nothing to depth.
    pub fn stages(&self) -> Vec<Vec<String>> {
        let nodes = self.nodes.lock();
        let mut depth: HashMap<String, usize> = HashMap::new();

        fn depth_of(
            name: &str,
            nodes: &IndexMap<String, NodeSlot>,
            depth: &mut HashMap<String, usize>,
        ) -> usize {
            if let Some(&d) = depth.get(name) {
                return d;
            }
            let d = nodes
                .get(name)
                .map(|slot| {
                    slot.deps
                        .iter()
                        .filter(|dep| nodes.contains_key(&dep.name))
                        .map(|dep| depth_of(&dep.name, nodes, depth) + 1)
                        .max()
                        .unwrap_or(0)
                })
                .unwrap_or(0);
            depth.insert(name.to_owned(), d);
            d
        }

        let names: Vec<String> = nodes.keys().cloned().collect();
        let mut stages: Vec<Vec<String>> = Vec::new();
        for name in names {
            let d = depth_of(&name, &nodes, &mut depth);
            while stages.len() <= d {
                stages.push(Vec::new());
            }
            stages[d].push(name);
        }
        stages
    }

    fn set_state_locked(
        &self,
        nodes: &mut IndexMap<String, NodeSlot>,
        name: &str,
        next: ServiceState,
        error: Option<String>,
    ) {
        let Some(slot) = nodes.get_mut(name) else {
            return;
        };
        let prev = slot.state;
        if prev == next {
            return;
        }
        slot.state = next;
        slot.error = error;
        self.events.publish(DomainEvent::ServiceStateChanged {
            service: name.to_owned(),
            prev,
            next,
        });
        if slot.classification == SafetyClassification::Critical
            && prev == ServiceState::Healthy
            && next == ServiceState::Failed
        {
            tracing::error!(service = name, "critical service failed");
            self.events.publish(DomainEvent::CriticalServiceFailure { service: name.to_owned() });
        }
    }

    /// Transition a service's state (health loop and supervisors).
    pub fn set_state(&self, name: &str, next: ServiceState) {
        let mut nodes = self.nodes.lock();
        self.set_state_locked(&mut nodes, name, next, None);
    }

    /// Initialize every registered service in dependency stages.
    ///
    /// Within a stage, init functions run in parallel, each under the
    /// startup timeout. A REQUIRED dependency that is not HEALTHY marks
    /// the dependent FAILED without running its init; OPTIONAL failures
    /// pass `None` into the dependency map.
    pub async fn startup_all(&self) -> HealthReport {
        let stages = self.stages();
        for (stage_index, stage) in stages.iter().enumerate() {
            let stage_start = Instant::now();
            let mut launches: Vec<(String, InitFn, DepMap)> = Vec::new();
            {
                let mut nodes = self.nodes.lock();
                for name in stage {
                    let slot = match nodes.get(name) {
                        Some(slot) => slot,
                        None => continue,
                    };
                    let deps = slot.deps.clone();

                    // Resolve dependencies against already-started stages.
                    let mut dep_map = DepMap::new();
                    let mut missing_required = None;
                    for dep in &deps {
                        let resolved = nodes
                            .get(&dep.name)
                            .filter(|d| d.state == ServiceState::Healthy)
                            .and_then(|d| d.instance.clone());
                        if resolved.is_none() && dep.kind == DependencyKind::Required {
                            missing_required = Some(dep.name.clone());
                            break;
                        }
                        dep_map.insert(dep.name.clone(), resolved);
                    }

                    if let Some(missing) = missing_required {
                        let message = format!("required dependency {missing} unavailable");
                        tracing::warn!(service = %name, %missing, "skipping service");
                        self.set_state_locked(
                            &mut nodes,
                            name,
                            ServiceState::Failed,
                            Some(message),
                        );
                        continue;
                    }

                    let Some(init) = nodes.get_mut(name).and_then(|s| s.init.take()) else {
                        continue;
                    };
                    self.set_state_locked(&mut nodes, name, ServiceState::Starting, None);
                    launches.push((name.clone(), init, dep_map));
                }
            }

            let timeout = self.startup_timeout;
            let results = futures_util::future::join_all(launches.into_iter().map(
                |(name, init, dep_map)| async move {
                    let start = Instant::now();
                    let outcome = tokio::time::timeout(timeout, init(dep_map)).await;
                    (name, outcome, start.elapsed())
                },
            ))
            .await;

            let mut nodes = self.nodes.lock();
            for (name, outcome, elapsed) in results {
                if let Some(slot) = nodes.get_mut(&name) {
                    slot.startup_ms = Some(elapsed.as_millis() as u64);
                }
                match outcome {
                    Ok(Ok(instance)) => {
                        if let Some(slot) = nodes.get_mut(&name) {
                            slot.instance = Some(instance);
                        }
                        self.set_state_locked(&mut nodes, &name, ServiceState::Healthy, None);
                        tracing::info!(service = %name, elapsed_ms = elapsed.as_millis() as u64, "service started");
                    }
                    Ok(Err(e)) => {
                        tracing::error!(service = %name, err = %e, "service init failed");
                        self.set_state_locked(
                            &mut nodes,
                            &name,
                            ServiceState::Failed,
                            Some(e.to_string()),
                        );
                    }
                    Err(_) => {
                        tracing::error!(service = %name, "service init timed out");
                        self.set_state_locked(
                            &mut nodes,
                            &name,
                            ServiceState::Failed,
                            Some("startup timeout".to_owned()),
                        );
                    }
                }
            }
            drop(nodes);
            self.stage_latencies.lock().push(stage_start.elapsed().as_millis() as u64);
            tracing::info!(stage = stage_index, "startup stage complete");
        }
        self.aggregate_health()
    }

    /// Fetch a HEALTHY service instance.
    pub fn get_service(&self, name: &str) -> CoreResult<ServiceInstance> {
        let nodes = self.nodes.lock();
        let slot = nodes
            .get(name)
            .ok_or_else(|| CoreError::unavailable(format!("service {name} is not registered")))?;
        if slot.state != ServiceState::Healthy {
            return Err(CoreError::unavailable(format!(
                "service {name} is {}",
                slot.state.as_str()
            )));
        }
        slot.instance
            .clone()
            .ok_or_else(|| CoreError::unavailable(format!("service {name} has no instance")))
    }

    /// Run every health probe once, applying state transitions.
    pub fn run_health_checks(&self) {
        let probes: Vec<(String, HealthFn, ServiceInstance, SafetyClassification, ServiceState)> = {
            let nodes = self.nodes.lock();
            nodes
                .iter()
                .filter_map(|(name, slot)| {
                    let health = slot.health.clone()?;
                    let instance = slot.instance.clone()?;
                    if matches!(slot.state, ServiceState::Healthy | ServiceState::Degraded) {
                        Some((name.clone(), health, instance, slot.classification, slot.state))
                    } else {
                        None
                    }
                })
                .collect()
        };

        for (name, health, instance, classification, state) in probes {
            let healthy = health(&instance);
            let mut nodes = self.nodes.lock();
            match (healthy, state) {
                (true, ServiceState::Degraded) => {
                    self.set_state_locked(&mut nodes, &name, ServiceState::Healthy, None)
                }
                (false, _) => {
                    let next = if classification == SafetyClassification::Critical {
                        ServiceState::Failed
                    } else {
                        ServiceState::Degraded
                    };
                    self.set_state_locked(
                        &mut nodes,
                        &name,
                        next,
                        Some("health check failed".to_owned()),
                    );
                }
                _ => {}
            }
        }
    }

    /// Stop every service in reverse topological order.
    ///
    /// Shutdown failures are logged and never abort the remaining
    /// services.
    pub async fn shutdown(&self) {
        let mut order: Vec<String> = self.stages().into_iter().flatten().collect();
        order.reverse();

        for name in order {
            let (instance, hook) = {
                let mut nodes = self.nodes.lock();
                let Some(slot) = nodes.get_mut(&name) else {
                    continue;
                };
                if !matches!(slot.state, ServiceState::Healthy | ServiceState::Degraded) {
                    continue;
                }
                (slot.instance.take(), slot.shutdown.clone())
            };

            if let (Some(instance), Some(hook)) = (instance, hook) {
                match tokio::time::timeout(self.shutdown_timeout, hook(instance)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(service = %name, err = %e, "shutdown hook failed"),
                    Err(_) => tracing::warn!(service = %name, "shutdown hook timed out"),
                }
            }
            let mut nodes = self.nodes.lock();
            self.set_state_locked(&mut nodes, &name, ServiceState::Stopped, None);
        }
        tracing::info!("service registry shutdown complete");
    }

    /// Per-service status plus the aggregate summary.
    pub fn aggregate_health(&self) -> HealthReport {
        let nodes = self.nodes.lock();
        let mut report = HealthReport::default();
        let mut latencies: Vec<(String, u64)> = Vec::new();
        for (name, slot) in nodes.iter() {
            *report.counts.entry(slot.state.as_str().to_owned()).or_insert(0) += 1;
            if slot.state == ServiceState::Failed {
                report.startup_errors += usize::from(slot.error.is_some());
            }
            if let Some(ms) = slot.startup_ms {
                latencies.push((name.clone(), ms));
            }
            let mut tags: Vec<String> = slot.tags.iter().cloned().collect();
            tags.sort();
            report.services.push(ServiceView {
                name: name.clone(),
                state: slot.state,
                classification: slot.classification,
                emergency_action: slot.emergency_action,
                deps: slot.deps.clone(),
                tags,
                error: slot.error.clone(),
                startup_ms: slot.startup_ms,
            });
        }
        latencies.sort_by(|a, b| b.1.cmp(&a.1));
        report.slowest_services = latencies.into_iter().take(5).map(|(n, _)| n).collect();
        report.stage_latencies_ms = self.stage_latencies.lock().clone();
        report
    }

    /// View of one service.
    pub fn service_view(&self, name: &str) -> Option<ServiceView> {
        self.aggregate_health().services.into_iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
