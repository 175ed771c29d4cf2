// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon configuration.
//!
//! Two layers, both immutable after boot: [`DaemonConfig`] comes from
//! flags/environment and carries runtime knobs; [`CoachConfig`] is the
//! JSON file loaded once at startup with the coach mapping, spec-table
//! extensions, interface names, and the security policies. Validation is
//! total at load time; a policy value outside its documented range
//! aborts startup.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use canlink::injector::SafetyLevel;
use canlink::spec::PgnDef;
use canlink::transport::InterfaceMap;

use crate::error::{CoreError, CoreResult};

/// Flags and environment configuration for the coachd daemon.
#[derive(Debug, Clone, clap::Args)]
pub struct DaemonConfig {
    /// Path to the coach configuration JSON file.
    #[arg(long, env = "COACHD_CONFIG")]
    pub config: PathBuf,

    /// Directory for recorder output files.
    #[arg(long, default_value = "recordings", env = "COACHD_RECORDINGS_DIR")]
    pub recordings_dir: PathBuf,

    /// Health poll interval in milliseconds.
    #[arg(long, default_value_t = 5000, env = "COACHD_HEALTH_CHECK_MS")]
    pub health_check_ms: u64,

    /// Watchdog timeout in milliseconds.
    #[arg(long, default_value_t = 15000, env = "COACHD_WATCHDOG_MS")]
    pub watchdog_ms: u64,

    /// Default command reconciliation deadline in milliseconds.
    #[arg(long, default_value_t = 2000, env = "COACHD_RECONCILE_MS")]
    pub reconcile_ms: u64,

    /// Command debounce window in milliseconds.
    #[arg(long, default_value_t = 100, env = "COACHD_DEBOUNCE_MS")]
    pub debounce_ms: u64,

    /// Recorder autosave interval in milliseconds.
    #[arg(long, default_value_t = 60000, env = "COACHD_AUTOSAVE_MS")]
    pub autosave_ms: u64,

    /// CAN transmit queue capacity.
    #[arg(long, default_value_t = 1024, env = "COACHD_TRANSMIT_CAPACITY")]
    pub transmit_capacity: usize,

    /// Recorder ring capacity in frames.
    #[arg(long, default_value_t = 100_000, env = "COACHD_RECORDER_CAPACITY")]
    pub recorder_capacity: usize,

    /// Injector safety validation level.
    #[arg(long, default_value = "strict", env = "COACHD_INJECTOR_SAFETY")]
    pub injector_safety: String,

    /// Per-service startup timeout in milliseconds.
    #[arg(long, default_value_t = 10_000, env = "COACHD_STARTUP_TIMEOUT_MS")]
    pub startup_timeout_ms: u64,

    /// Per-service shutdown timeout in milliseconds.
    #[arg(long, default_value_t = 5_000, env = "COACHD_SHUTDOWN_TIMEOUT_MS")]
    pub shutdown_timeout_ms: u64,
}

impl DaemonConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_ms)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }

    pub fn reconcile_deadline(&self) -> Duration {
        Duration::from_millis(self.reconcile_ms)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn autosave_interval(&self) -> Duration {
        Duration::from_millis(self.autosave_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn injector_safety_level(&self) -> CoreResult<SafetyLevel> {
        match self.injector_safety.as_str() {
            "strict" => Ok(SafetyLevel::Strict),
            "moderate" => Ok(SafetyLevel::Moderate),
            "permissive" => Ok(SafetyLevel::Permissive),
            other => Err(CoreError::invalid_input(format!("unknown safety level {other}"))),
        }
    }
}

/// Kind of coach device an entity models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Light,
    Slide,
    Awning,
    Tank,
    Hvac,
    Switch,
    Sensor,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Slide => "slide",
            Self::Awning => "awning",
            Self::Tank => "tank",
            Self::Hvac => "hvac",
            Self::Switch => "switch",
            Self::Sensor => "sensor",
        }
    }
}

/// One coach-mapping entry: a physical device and its bus addressing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDefinition {
    /// Stable entity id (`light.galley`).
    pub id: String,
    pub kind: EntityKind,
    /// RV-C instance number matched against decoded frames.
    pub instance: u8,
    /// DGN whose status frames update this entity.
    pub status_dgn: u32,
    /// DGN commands are encoded to; absent for sensor-only entities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_dgn: Option<u32>,
    /// Logical interface the device lives on.
    pub interface: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl EntityDefinition {
    pub fn controllable(&self) -> bool {
        self.command_dgn.is_some()
    }
}

/// PIN security policy. Every field range matches the documented bounds;
/// out-of-range values fail validation at load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinPolicy {
    pub min_length: u8,
    pub max_failed_attempts: u32,
    pub lockout_minutes: u64,
    pub emergency_session_minutes: u64,
    pub override_session_minutes: u64,
    pub maintenance_session_minutes: u64,
    pub rotation_days: u32,
    pub progressive_lockout: bool,
}

impl Default for PinPolicy {
    fn default() -> Self {
        Self {
            min_length: 4,
            max_failed_attempts: 3,
            lockout_minutes: 15,
            emergency_session_minutes: 5,
            override_session_minutes: 15,
            maintenance_session_minutes: 30,
            rotation_days: 30,
            progressive_lockout: true,
        }
    }
}

impl PinPolicy {
    fn validate(&self) -> CoreResult<()> {
        check_range("pin.min_length", self.min_length as u64, 4, 8)?;
        check_range("pin.max_failed_attempts", self.max_failed_attempts as u64, 2, 10)?;
        check_range("pin.lockout_minutes", self.lockout_minutes, 5, 60)?;
        check_range("pin.emergency_session_minutes", self.emergency_session_minutes, 1, 15)?;
        check_range("pin.override_session_minutes", self.override_session_minutes, 5, 60)?;
        check_range("pin.maintenance_session_minutes", self.maintenance_session_minutes, 15, 120)?;
        check_range("pin.rotation_days", self.rotation_days as u64, 7, 90)?;
        Ok(())
    }

    pub fn lockout_duration(&self) -> Duration {
        Duration::from_secs(self.lockout_minutes * 60)
    }
}

/// Rate limiting policy for the HTTP collaborator and the PIN paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitPolicy {
    pub requests_per_minute: u32,
    pub burst_limit: u32,
    pub safety_ops_per_minute: u32,
    pub emergency_ops_per_hour: u32,
    pub pin_attempts_per_minute: u32,
    pub trusted_networks: Vec<String>,
    pub admin_multiplier: f64,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst_limit: 10,
            safety_ops_per_minute: 5,
            emergency_ops_per_hour: 3,
            pin_attempts_per_minute: 3,
            trusted_networks: Vec::new(),
            admin_multiplier: 2.0,
        }
    }
}

impl RateLimitPolicy {
    fn validate(&self) -> CoreResult<()> {
        check_range("rate.requests_per_minute", self.requests_per_minute as u64, 10, 300)?;
        check_range("rate.burst_limit", self.burst_limit as u64, 5, 50)?;
        check_range("rate.safety_ops_per_minute", self.safety_ops_per_minute as u64, 1, 20)?;
        check_range("rate.emergency_ops_per_hour", self.emergency_ops_per_hour as u64, 1, 10)?;
        check_range("rate.pin_attempts_per_minute", self.pin_attempts_per_minute as u64, 1, 10)?;
        if !(1.0..=5.0).contains(&self.admin_multiplier) {
            return Err(CoreError::invalid_input(format!(
                "rate.admin_multiplier {} outside 1.0..=5.0",
                self.admin_multiplier
            )));
        }
        for network in &self.trusted_networks {
            parse_cidr(network)?;
        }
        Ok(())
    }
}

/// Retention windows for persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub history_days: u32,
    pub security_audit_days: u32,
    pub compliance_audit_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { history_days: 7, security_audit_days: 365, compliance_audit_days: 2555 }
    }
}

/// Operator PIN classes in ascending scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinClass {
    Emergency,
    Override,
    Maintenance,
}

impl PinClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Emergency => "emergency",
            Self::Override => "override",
            Self::Maintenance => "maintenance",
        }
    }
}

/// One provisioned PIN: class plus the sha256 hex digest of the PIN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinDefinition {
    pub class: PinClass,
    pub digest: String,
}

/// The boot-time coach configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoachConfig {
    /// Physical interfaces to bind.
    pub interfaces: Vec<String>,
    /// Logical to physical interface names.
    pub interface_map: InterfaceMap,
    /// Spec-table extensions; entries shadow built-ins on collision.
    pub spec_extensions: Vec<PgnDef>,
    pub coach_mapping: Vec<EntityDefinition>,
    pub pin_policy: PinPolicy,
    pub rate_limits: RateLimitPolicy,
    pub retention: RetentionPolicy,
    pub pins: Vec<PinDefinition>,
    /// Dangerous-PGN additions merged over the built-in set.
    pub dangerous_pgns: Vec<u32>,
    /// Per-kind reconciliation deadline overrides in milliseconds.
    pub reconcile_overrides_ms: HashMap<EntityKind, u64>,
    /// Release identifier surfaced by the health endpoints.
    pub release_id: String,
}

impl Default for CoachConfig {
    fn default() -> Self {
        Self {
            interfaces: Vec::new(),
            interface_map: InterfaceMap::new(),
            spec_extensions: Vec::new(),
            coach_mapping: Vec::new(),
            pin_policy: PinPolicy::default(),
            rate_limits: RateLimitPolicy::default(),
            retention: RetentionPolicy::default(),
            pins: Vec::new(),
            dangerous_pgns: Vec::new(),
            reconcile_overrides_ms: HashMap::new(),
            release_id: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }
}

impl CoachConfig {
    /// Load and fully validate the config file.
    pub fn load(path: &std::path::Path) -> CoreResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CoreError::invalid_input(format!("cannot read config {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| CoreError::invalid_input(format!("malformed config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.interfaces.is_empty() {
            return Err(CoreError::invalid_input("at least one CAN interface is required"));
        }
        self.pin_policy.validate()?;
        self.rate_limits.validate()?;

        let mut seen = HashSet::new();
        for entity in &self.coach_mapping {
            if entity.id.is_empty() {
                return Err(CoreError::invalid_input("entity id must not be empty"));
            }
            if !seen.insert(entity.id.as_str()) {
                return Err(CoreError::invalid_input(format!("duplicate entity id {}", entity.id)));
            }
        }

        for pin in &self.pins {
            if pin.digest.len() != 64 || !pin.digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(CoreError::invalid_input(format!(
                    "pin digest for class {} is not a sha256 hex digest",
                    pin.class.as_str()
                )));
            }
        }
        Ok(())
    }

    /// Reconciliation deadline for one device kind.
    pub fn reconcile_deadline(&self, kind: EntityKind, default: Duration) -> Duration {
        self.reconcile_overrides_ms
            .get(&kind)
            .map(|ms| Duration::from_millis(*ms))
            .unwrap_or(default)
    }

    pub fn entity(&self, id: &str) -> Option<&EntityDefinition> {
        self.coach_mapping.iter().find(|e| e.id == id)
    }
}

fn check_range(name: &str, value: u64, min: u64, max: u64) -> CoreResult<()> {
    if value < min || value > max {
        return Err(CoreError::invalid_input(format!("{name} {value} outside {min}..={max}")));
    }
    Ok(())
}

/// Minimal CIDR validation: `a.b.c.d/len`.
fn parse_cidr(text: &str) -> CoreResult<(std::net::Ipv4Addr, u8)> {
    let (addr, len) = text
        .split_once('/')
        .ok_or_else(|| CoreError::invalid_input(format!("{text} is not CIDR notation")))?;
    let addr: std::net::Ipv4Addr = addr
        .parse()
        .map_err(|_| CoreError::invalid_input(format!("{text} has a bad network address")))?;
    let len: u8 = len
        .parse()
        .map_err(|_| CoreError::invalid_input(format!("{text} has a bad prefix length")))?;
    if len > 32 {
        return Err(CoreError::invalid_input(format!("{text} prefix length exceeds 32")));
    }
    Ok((addr, len))
}

/// Whether an IPv4 address falls inside any of the given CIDR networks.
pub fn ip_in_networks(ip: &str, networks: &[String]) -> bool {
    let Ok(ip) = ip.parse::<std::net::Ipv4Addr>() else {
        return false;
    };
    networks.iter().any(|net| {
        let Ok((addr, len)) = parse_cidr(net) else {
            return false;
        };
        let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
        (u32::from(ip) & mask) == (u32::from(addr) & mask)
    })
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
