// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Rule-driven message filter.
//!
//! Rules are evaluated in descending priority until a BLOCK action fires
//! or the rule set is exhausted. Non-blocking actions (log, alert,
//! capture, forward, modify) accumulate without terminating evaluation.
//! Rules whose id starts with the reserved `sys.` prefix are system
//! rules and may not be removed or disabled.

use std::collections::HashSet;

use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{CanError, CanResult};
use crate::frame::DecodedFrame;
use crate::ring::Ring;
use crate::safety::{
    EmergencyAction, EmergencyFlag, EmergencyOutcome, SafetyAware, SafetyClassification,
    SafetyStatus,
};

/// Reserved id prefix for system rules.
pub const SYSTEM_RULE_PREFIX: &str = "sys.";

/// Frame attribute a condition compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterField {
    CanId,
    Pgn,
    Source,
    Destination,
    Data,
    DataLength,
    Interface,
    Protocol,
    MessageKind,
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Contains,
    Matches,
    Wildcard,
}

/// Comparison operand. Numbers cover the id/address fields, text covers
/// interface/protocol/kind, bytes cover payload containment, and lists
/// back the set operators.
///
/// Untagged: a JSON number list always deserializes as `NumberList`;
/// the byte comparisons accept both spellings so imported rules behave
/// the same as ones built in code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Number(u64),
    Text(String),
    NumberList(Vec<u64>),
    Bytes(Vec<u8>),
    TextList(Vec<String>),
}

impl FilterValue {
    /// View a bytes-or-number-list operand as bytes, when every element
    /// fits a byte.
    fn as_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Self::Bytes(bytes) => Some(bytes.clone()),
            Self::NumberList(values) => values
                .iter()
                .map(|v| u8::try_from(*v).ok())
                .collect::<Option<Vec<u8>>>(),
            _ => None,
        }
    }
}

/// A single field comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub field: FilterField,
    pub op: FilterOp,
    pub value: FilterValue,
}

impl FilterCondition {
    pub fn new(field: FilterField, op: FilterOp, value: FilterValue) -> Self {
        Self { field, op, value }
    }

    /// Evaluate against a decoded frame. Type mismatches between the
    /// field and the operand evaluate to false rather than erroring.
    pub fn evaluate(&self, frame: &DecodedFrame) -> bool {
        match self.field {
            FilterField::CanId => self.compare_number(frame.frame.can_id as u64),
            FilterField::Pgn => frame.pgn.map(|p| self.compare_number(p as u64)).unwrap_or(false),
            FilterField::Source => {
                frame.source.map(|s| self.compare_number(s as u64)).unwrap_or(false)
            }
            FilterField::Destination => {
                frame.destination.map(|d| self.compare_number(d as u64)).unwrap_or(false)
            }
            FilterField::DataLength => self.compare_number(frame.frame.data.len() as u64),
            FilterField::Data => self.compare_bytes(&frame.frame.data),
            FilterField::Interface => self.compare_text(&frame.frame.interface),
            FilterField::Protocol => self.compare_text(frame.protocol.as_str()),
            FilterField::MessageKind => self.compare_text(frame.kind.as_str()),
        }
    }

    fn compare_number(&self, actual: u64) -> bool {
        match (&self.op, &self.value) {
            (FilterOp::Eq, FilterValue::Number(v)) => actual == *v,
            (FilterOp::Ne, FilterValue::Number(v)) => actual != *v,
            (FilterOp::Lt, FilterValue::Number(v)) => actual < *v,
            (FilterOp::Le, FilterValue::Number(v)) => actual <= *v,
            (FilterOp::Gt, FilterValue::Number(v)) => actual > *v,
            (FilterOp::Ge, FilterValue::Number(v)) => actual >= *v,
            (FilterOp::In, FilterValue::NumberList(list)) => list.contains(&actual),
            (FilterOp::NotIn, FilterValue::NumberList(list)) => !list.contains(&actual),
            (FilterOp::Matches, FilterValue::Text(pattern)) => {
                regex_matches(pattern, &format!("{actual:x}"))
            }
            (FilterOp::Wildcard, FilterValue::Text(pattern)) => {
                glob_matches(pattern, &format!("{actual:x}"))
            }
            _ => false,
        }
    }

    fn compare_text(&self, actual: &str) -> bool {
        match (&self.op, &self.value) {
            (FilterOp::Eq, FilterValue::Text(v)) => actual == v,
            (FilterOp::Ne, FilterValue::Text(v)) => actual != v,
            (FilterOp::In, FilterValue::TextList(list)) => list.iter().any(|v| v == actual),
            (FilterOp::NotIn, FilterValue::TextList(list)) => !list.iter().any(|v| v == actual),
            (FilterOp::Contains, FilterValue::Text(v)) => actual.contains(v.as_str()),
            (FilterOp::Matches, FilterValue::Text(pattern)) => regex_matches(pattern, actual),
            (FilterOp::Wildcard, FilterValue::Text(pattern)) => glob_matches(pattern, actual),
            _ => false,
        }
    }

    fn compare_bytes(&self, actual: &[u8]) -> bool {
        match &self.op {
            FilterOp::Eq => self.value.as_bytes().is_some_and(|v| actual == v.as_slice()),
            FilterOp::Ne => self.value.as_bytes().is_some_and(|v| actual != v.as_slice()),
            FilterOp::Contains => self.value.as_bytes().is_some_and(|needle| {
                !needle.is_empty() && actual.windows(needle.len()).any(|w| w == needle.as_slice())
            }),
            FilterOp::Matches => match &self.value {
                FilterValue::Text(pattern) => regex_matches(pattern, &hex_string(actual)),
                _ => false,
            },
            FilterOp::Wildcard => match &self.value {
                FilterValue::Text(pattern) => glob_matches(pattern, &hex_string(actual)),
                _ => false,
            },
            _ => false,
        }
    }
}

fn hex_string(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

fn regex_matches(pattern: &str, text: &str) -> bool {
    Regex::new(pattern).map(|re| re.is_match(text)).unwrap_or(false)
}

/// Translate a glob pattern to an anchored regex and match.
fn glob_matches(pattern: &str, text: &str) -> bool {
    let mut regex = String::with_capacity(pattern.len() + 2);
    regex.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    regex_matches(&regex, text)
}

/// How multiple conditions combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionLogic {
    #[default]
    And,
    Or,
}

/// Action taken when a rule matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FilterAction {
    Pass,
    Block,
    Log,
    Alert,
    Capture,
    Forward { interface: String },
    Modify { patches: Vec<BytePatch> },
}

/// One payload byte replacement for the modify action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BytePatch {
    pub index: usize,
    pub value: u8,
}

/// An ordered filter rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub conditions: Vec<FilterCondition>,
    #[serde(default)]
    pub logic: ConditionLogic,
    pub actions: Vec<FilterAction>,
}

fn default_enabled() -> bool {
    true
}

impl FilterRule {
    pub fn is_system(&self) -> bool {
        self.id.starts_with(SYSTEM_RULE_PREFIX)
    }

    /// Whether this rule's actions are pass-only (no block, capture,
    /// alert, forward, or modify side effects).
    pub fn is_pass_only(&self) -> bool {
        self.actions
            .iter()
            .all(|a| matches!(a, FilterAction::Pass | FilterAction::Log))
    }

    fn matches(&self, frame: &DecodedFrame) -> bool {
        if self.conditions.is_empty() {
            return true;
        }
        match self.logic {
            ConditionLogic::And => self.conditions.iter().all(|c| c.evaluate(frame)),
            ConditionLogic::Or => self.conditions.iter().any(|c| c.evaluate(frame)),
        }
    }
}

/// Alert published when a matching rule carries the alert action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterAlert {
    pub rule_id: String,
    pub rule_name: String,
    pub can_id: u32,
    pub interface: String,
    pub timestamp_ms: u64,
}

/// Evaluation outcome for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterVerdict {
    pub blocked: bool,
    /// Rule id that blocked the frame, if any.
    pub blocked_by: Option<String>,
    /// Interfaces the frame should be forwarded onto.
    pub forward_to: Vec<String>,
    /// The frame, with any modify patches applied.
    pub frame: DecodedFrame,
    /// Ids of every rule that matched.
    pub matched: Vec<String>,
}

/// Aggregate filter counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterStats {
    pub processed: u64,
    pub passed: u64,
    pub blocked: u64,
    pub captured: u64,
    pub alerted: u64,
}

/// Rule-driven pass/block/capture/alert filter over decoded frames.
pub struct MessageFilter {
    rules: RwLock<Vec<FilterRule>>,
    capture: Mutex<Ring<DecodedFrame>>,
    stats: Mutex<FilterStats>,
    alert_tx: broadcast::Sender<FilterAlert>,
    emergency: EmergencyFlag,
    running: std::sync::atomic::AtomicBool,
    max_rules: usize,
}

impl MessageFilter {
    pub fn new(capture_capacity: usize, max_rules: usize, emergency: EmergencyFlag) -> Self {
        let (alert_tx, _) = broadcast::channel(256);
        let filter = Self {
            rules: RwLock::new(Vec::new()),
            capture: Mutex::new(Ring::new(capture_capacity)),
            stats: Mutex::new(FilterStats::default()),
            alert_tx,
            emergency,
            running: std::sync::atomic::AtomicBool::new(true),
            max_rules: max_rules.max(1),
        };
        filter.install_system_rules();
        filter
    }

    /// System rules present in every deployment.
    fn install_system_rules(&self) {
        let rule = FilterRule {
            id: format!("{SYSTEM_RULE_PREFIX}invalid_can_id"),
            name: "Block invalid CAN ids".to_owned(),
            description: "Blocks frames whose arbitration id exceeds 29 bits".to_owned(),
            priority: 90,
            enabled: false,
            conditions: vec![FilterCondition::new(
                FilterField::CanId,
                FilterOp::Gt,
                FilterValue::Number(0x1FFF_FFFF),
            )],
            logic: ConditionLogic::And,
            actions: vec![FilterAction::Block, FilterAction::Log],
        };
        let mut rules = self.rules.write();
        rules.push(rule);
        Self::sort(&mut rules);
    }

    fn sort(rules: &mut [FilterRule]) {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
    }

    /// Subscribe to alert-action events.
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<FilterAlert> {
        self.alert_tx.subscribe()
    }

    /// Install a rule. Duplicate ids and rule-count overflow conflict.
    pub fn add_rule(&self, rule: FilterRule) -> CanResult<()> {
        if rule.id.is_empty() {
            return Err(CanError::invalid_input("rule id must not be empty"));
        }
        let mut rules = self.rules.write();
        if rules.len() >= self.max_rules {
            return Err(CanError::conflict(format!("rule limit of {} reached", self.max_rules)));
        }
        if rules.iter().any(|r| r.id == rule.id) {
            return Err(CanError::conflict(format!("rule {} already exists", rule.id)));
        }
        tracing::info!(rule_id = %rule.id, priority = rule.priority, "filter rule added");
        rules.push(rule);
        Self::sort(&mut rules);
        Ok(())
    }

    /// Remove a rule. System rules may not be removed.
    pub fn remove_rule(&self, rule_id: &str) -> CanResult<FilterRule> {
        if rule_id.starts_with(SYSTEM_RULE_PREFIX) {
            return Err(CanError::conflict(format!("system rule {rule_id} may not be removed")));
        }
        let mut rules = self.rules.write();
        let idx = rules
            .iter()
            .position(|r| r.id == rule_id)
            .ok_or_else(|| CanError::not_found(format!("rule {rule_id} does not exist")))?;
        Ok(rules.remove(idx))
    }

    /// Enable or disable a rule. System rules may not be disabled once
    /// enabled, but ship disabled and can be switched on.
    pub fn set_enabled(&self, rule_id: &str, enabled: bool) -> CanResult<()> {
        let mut rules = self.rules.write();
        let rule = rules
            .iter_mut()
            .find(|r| r.id == rule_id)
            .ok_or_else(|| CanError::not_found(format!("rule {rule_id} does not exist")))?;
        rule.enabled = enabled;
        Ok(())
    }

    pub fn rule(&self, rule_id: &str) -> Option<FilterRule> {
        self.rules.read().iter().find(|r| r.id == rule_id).cloned()
    }

    /// All rules in evaluation order.
    pub fn rules(&self) -> Vec<FilterRule> {
        self.rules.read().clone()
    }

    /// Run one decoded frame through the rule set.
    pub fn process(&self, frame: DecodedFrame) -> CanResult<FilterVerdict> {
        self.emergency.guard("filter")?;
        if !self.running.load(std::sync::atomic::Ordering::Acquire) {
            // Fail-safe: a stopped filter passes traffic untouched.
            return Ok(FilterVerdict {
                blocked: false,
                blocked_by: None,
                forward_to: Vec::new(),
                frame,
                matched: Vec::new(),
            });
        }

        let rules = self.rules.read();
        let mut verdict = FilterVerdict {
            blocked: false,
            blocked_by: None,
            forward_to: Vec::new(),
            frame,
            matched: Vec::new(),
        };
        let mut capture = false;
        let mut alerts: Vec<FilterAlert> = Vec::new();
        let mut forwarded: HashSet<String> = HashSet::new();

        for rule in rules.iter() {
            if !rule.enabled || !rule.matches(&verdict.frame) {
                continue;
            }
            verdict.matched.push(rule.id.clone());

            for action in &rule.actions {
                match action {
                    FilterAction::Pass => {}
                    FilterAction::Block => {
                        verdict.blocked = true;
                        verdict.blocked_by = Some(rule.id.clone());
                    }
                    FilterAction::Log => {
                        tracing::info!(
                            rule = %rule.name,
                            can_id = format_args!("{:#x}", verdict.frame.frame.can_id),
                            "filter match"
                        );
                    }
                    FilterAction::Alert => {
                        alerts.push(FilterAlert {
                            rule_id: rule.id.clone(),
                            rule_name: rule.name.clone(),
                            can_id: verdict.frame.frame.can_id,
                            interface: verdict.frame.frame.interface.clone(),
                            timestamp_ms: verdict.frame.frame.timestamp_ms,
                        });
                    }
                    FilterAction::Capture => capture = true,
                    FilterAction::Forward { interface } => {
                        if forwarded.insert(interface.clone()) {
                            verdict.forward_to.push(interface.clone());
                        }
                    }
                    FilterAction::Modify { patches } => {
                        for patch in patches {
                            if let Some(byte) = verdict.frame.frame.data.get_mut(patch.index) {
                                *byte = patch.value;
                            }
                        }
                    }
                }
            }

            if verdict.blocked {
                break;
            }
        }
        drop(rules);

        let mut stats = self.stats.lock();
        stats.processed += 1;
        if verdict.blocked {
            stats.blocked += 1;
        } else {
            stats.passed += 1;
        }
        if capture {
            stats.captured += 1;
        }
        stats.alerted += alerts.len() as u64;
        drop(stats);

        if capture {
            self.capture.lock().push(verdict.frame.clone());
        }
        for alert in alerts {
            let _ = self.alert_tx.send(alert);
        }

        Ok(verdict)
    }

    /// Snapshot of captured frames, oldest first.
    pub fn captured(&self) -> Vec<DecodedFrame> {
        self.capture.lock().snapshot()
    }

    pub fn clear_captured(&self) {
        self.capture.lock().clear();
    }

    pub fn statistics(&self) -> FilterStats {
        self.stats.lock().clone()
    }

    pub fn reset_statistics(&self) {
        *self.stats.lock() = FilterStats::default();
    }

    /// Export the user rule set as JSON. System rules stay out so an
    /// import into another deployment cannot collide with its own.
    pub fn export_rules(&self) -> CanResult<String> {
        let rules: Vec<FilterRule> =
            self.rules.read().iter().filter(|r| !r.is_system()).cloned().collect();
        serde_json::to_string_pretty(&rules)
            .map_err(|e| CanError::internal(format!("serialize rules: {e}")))
    }

    /// Import rules from an exported JSON document. Returns the number
    /// installed; the first conflict aborts without installing the rest.
    pub fn import_rules(&self, json: &str) -> CanResult<usize> {
        let rules: Vec<FilterRule> = serde_json::from_str(json)
            .map_err(|e| CanError::invalid_input(format!("malformed rule document: {e}")))?;
        let mut installed = 0;
        for rule in rules {
            if rule.is_system() {
                return Err(CanError::invalid_input(format!(
                    "rule {} uses the reserved system prefix",
                    rule.id
                )));
            }
            self.add_rule(rule)?;
            installed += 1;
        }
        Ok(installed)
    }
}

impl SafetyAware for MessageFilter {
    fn name(&self) -> &str {
        "message_filter"
    }

    fn classification(&self) -> SafetyClassification {
        SafetyClassification::Operational
    }

    fn emergency_action(&self) -> EmergencyAction {
        EmergencyAction::EnterSafeMode
    }

    fn safety_status(&self) -> SafetyStatus {
        SafetyStatus {
            service: "message_filter".to_owned(),
            classification: SafetyClassification::Operational,
            running: self.running.load(std::sync::atomic::Ordering::Acquire),
            emergency_active: self.emergency.is_active(),
            reason: self.emergency.reason(),
        }
    }

    fn emergency_stop(&self, reason: &str) -> futures_util::future::BoxFuture<'_, EmergencyOutcome> {
        self.running.store(false, std::sync::atomic::Ordering::Release);
        tracing::warn!(reason, "message filter entering safe mode");
        Box::pin(async move { self.emergency_action().outcome() })
    }
}

#[cfg(test)]
#[path = "filter_tests.rs"]
mod tests;
