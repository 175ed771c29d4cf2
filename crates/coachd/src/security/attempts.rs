// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Attempt tracking, suspicious-pattern detection, lockout, and risk
//! scoring.
//!
//! Attempts are append-only; summaries and scores are computed over
//! sliding windows and never mutate history.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use canlink::frame::epoch_ms;
use canlink::ring::Ring;

use crate::events::{DomainEvent, EventBus};
use crate::repository::audit::{AuditKind, SecurityAuditRepository};
use crate::security::ThreatSeverity;

/// Attempts retained in memory for windowed queries.
const ATTEMPT_CAPACITY: usize = 10_000;

/// Sliding window for pattern checks.
pub const PATTERN_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Kind of security-relevant attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptKind {
    Login,
    Pin,
    SafetyOp,
    UnauthorizedAccess,
    RateLimit,
    Mfa,
    TokenRefresh,
}

/// Outcome of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failed,
    Blocked,
    RateLimited,
    Expired,
}

/// One security attempt (append-only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityAttempt {
    pub kind: AttemptKind,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Whether the target was a safety endpoint (raises severity).
    pub safety_endpoint: bool,
    pub timestamp_ms: u64,
}

impl SecurityAttempt {
    pub fn new(kind: AttemptKind, outcome: AttemptOutcome) -> Self {
        Self {
            kind,
            outcome,
            principal: None,
            ip: None,
            user_agent: None,
            reason: None,
            safety_endpoint: false,
            timestamp_ms: epoch_ms(),
        }
    }

    pub fn principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn safety(mut self) -> Self {
        self.safety_endpoint = true;
        self
    }
}

/// Windowed aggregation over one principal's attempts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub total: u64,
    pub successes: u64,
    pub failed: u64,
    pub blocked: u64,
    pub rate_limited: u64,
    pub unique_ips: usize,
}

/// Bounded risk accumulation for one principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub principal: String,
    pub score: u32,
    pub level: ThreatSeverity,
}

/// Pattern-check thresholds (counts within [`PATTERN_WINDOW`]).
#[derive(Debug, Clone)]
pub struct PatternThresholds {
    pub failed_logins: u64,
    pub failed_pins: u64,
    pub rate_limit_trips: u64,
    pub unique_ips: usize,
}

impl Default for PatternThresholds {
    fn default() -> Self {
        Self { failed_logins: 5, failed_pins: 3, rate_limit_trips: 10, unique_ips: 5 }
    }
}

/// Aggregates attempts, detects suspicious patterns, publishes threats.
pub struct SecurityOrchestrator {
    attempts: Mutex<Ring<SecurityAttempt>>,
    thresholds: PatternThresholds,
    audit: Arc<SecurityAuditRepository>,
    events: EventBus,
}

impl SecurityOrchestrator {
    pub fn new(
        thresholds: PatternThresholds,
        audit: Arc<SecurityAuditRepository>,
        events: EventBus,
    ) -> Self {
        Self {
            attempts: Mutex::new(Ring::new(ATTEMPT_CAPACITY)),
            thresholds,
            audit,
            events,
        }
    }

    /// Record one attempt, audit it, and run the pattern checks.
    pub fn track(&self, attempt: SecurityAttempt) {
        self.audit.append(
            AuditKind::SecurityAttempt,
            attempt.principal.clone(),
            serde_json::json!({
                "kind": attempt.kind,
                "outcome": attempt.outcome,
                "ip": attempt.ip,
                "reason": attempt.reason,
            }),
            attempt.safety_endpoint,
        );
        self.attempts.lock().push(attempt.clone());

        if attempt.outcome != AttemptOutcome::Success {
            self.check_patterns(&attempt);
        }
    }

    /// Summary for one principal within `window` ending at `now_ms`.
    pub fn summary(&self, principal: &str, window: Duration, now_ms: u64) -> AttemptSummary {
        let cutoff = now_ms.saturating_sub(window.as_millis() as u64);
        let attempts = self.attempts.lock();
        let mut summary = AttemptSummary::default();
        let mut ips = HashSet::new();
        for attempt in attempts.iter() {
            if attempt.timestamp_ms < cutoff || attempt.principal.as_deref() != Some(principal) {
                continue;
            }
            summary.total += 1;
            match attempt.outcome {
                AttemptOutcome::Success => summary.successes += 1,
                AttemptOutcome::Failed | AttemptOutcome::Expired => summary.failed += 1,
                AttemptOutcome::Blocked => summary.blocked += 1,
                AttemptOutcome::RateLimited => summary.rate_limited += 1,
            }
            if let Some(ref ip) = attempt.ip {
                ips.insert(ip.clone());
            }
        }
        summary.unique_ips = ips.len();
        summary
    }

    /// Bounded risk accumulation: recent failures x10, blocks x20,
    /// rate-limit trips x5, unique-ip excess x15; 25/50/100 tier map.
    pub fn risk_score(&self, principal: &str, now_ms: u64) -> RiskAssessment {
        let hour = self.summary(principal, Duration::from_secs(3600), now_ms);
        let day = self.summary(principal, Duration::from_secs(24 * 3600), now_ms);

        let mut score = hour.failed as u32 * 10;
        score += day.blocked as u32 * 20;
        score += day.rate_limited as u32 * 5;
        score += (day.unique_ips.saturating_sub(3)) as u32 * 15;

        let level = if score >= 100 {
            ThreatSeverity::Critical
        } else if score >= 50 {
            ThreatSeverity::High
        } else if score >= 25 {
            ThreatSeverity::Medium
        } else {
            ThreatSeverity::Low
        };
        RiskAssessment { principal: principal.to_owned(), score, level }
    }

    fn check_patterns(&self, attempt: &SecurityAttempt) {
        let now = attempt.timestamp_ms;
        let cutoff = now.saturating_sub(PATTERN_WINDOW.as_millis() as u64);
        let attempts = self.attempts.lock();

        let in_window = |a: &SecurityAttempt| a.timestamp_ms >= cutoff;
        let same_principal =
            |a: &SecurityAttempt| a.principal.is_some() && a.principal == attempt.principal;

        let mut patterns: Vec<(&'static str, ThreatSeverity)> = Vec::new();

        let failed_logins = attempts
            .iter()
            .filter(|a| {
                in_window(a)
                    && same_principal(a)
                    && a.kind == AttemptKind::Login
                    && a.outcome == AttemptOutcome::Failed
            })
            .count() as u64;
        if failed_logins > self.thresholds.failed_logins {
            patterns.push(("excessive_failed_logins", ThreatSeverity::High));
        }

        let failed_pins = attempts
            .iter()
            .filter(|a| {
                in_window(a)
                    && same_principal(a)
                    && a.kind == AttemptKind::Pin
                    && a.outcome == AttemptOutcome::Failed
            })
            .count() as u64;
        if failed_pins > self.thresholds.failed_pins {
            patterns.push(("excessive_failed_pins", ThreatSeverity::High));
        }

        let rate_trips = attempts
            .iter()
            .filter(|a| in_window(a) && same_principal(a) && a.kind == AttemptKind::RateLimit)
            .count() as u64;
        if rate_trips > self.thresholds.rate_limit_trips {
            patterns.push(("excessive_rate_limiting", ThreatSeverity::Medium));
        }

        let unique_ips: HashSet<&str> = attempts
            .iter()
            .filter(|a| in_window(a) && same_principal(a))
            .filter_map(|a| a.ip.as_deref())
            .collect();
        if unique_ips.len() > self.thresholds.unique_ips {
            patterns.push(("distributed_attack", ThreatSeverity::High));
        }

        // Credential stuffing: many distinct principals failing at a high
        // ratio across the whole window.
        let mut failures_by_principal: HashMap<&str, u64> = HashMap::new();
        let mut total_failed = 0u64;
        let mut total_success = 0u64;
        for a in attempts.iter().filter(|a| in_window(a) && a.kind == AttemptKind::Login) {
            match a.outcome {
                AttemptOutcome::Failed => {
                    total_failed += 1;
                    if let Some(ref p) = a.principal {
                        *failures_by_principal.entry(p.as_str()).or_default() += 1;
                    }
                }
                AttemptOutcome::Success => total_success += 1,
                _ => {}
            }
        }
        if failures_by_principal.len() >= 10
            && total_failed >= 20
            && total_failed * 5 > (total_failed + total_success) * 4
        {
            patterns.push(("credential_stuffing", ThreatSeverity::Critical));
        }
        drop(attempts);

        if patterns.is_empty() {
            return;
        }

        let mut severity =
            patterns.iter().map(|(_, s)| *s).max().unwrap_or(ThreatSeverity::Medium);
        if patterns.len() >= 2 {
            severity = severity.bump();
        }
        if attempt.safety_endpoint && severity < ThreatSeverity::High {
            severity = ThreatSeverity::High;
        }

        let names: Vec<&str> = patterns.iter().map(|(n, _)| *n).collect();
        tracing::warn!(
            principal = attempt.principal.as_deref().unwrap_or("-"),
            severity = severity.as_str(),
            patterns = ?names,
            "suspicious activity detected"
        );
        self.audit.append(
            AuditKind::SecurityThreat,
            attempt.principal.clone(),
            serde_json::json!({ "patterns": names, "severity": severity }),
            true,
        );
        for (pattern, _) in &patterns {
            self.events.publish(DomainEvent::SecurityThreat {
                severity,
                pattern: (*pattern).to_owned(),
                principal: attempt.principal.clone(),
                safety_endpoint: attempt.safety_endpoint,
            });
        }
    }

    /// Number of attempts currently retained.
    pub fn len(&self) -> usize {
        self.attempts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.lock().is_empty()
    }
}

#[derive(Debug, Default)]
struct LockoutState {
    failures: VecDeque<u64>,
    locked_until_ms: u64,
    consecutive_lockouts: u32,
}

/// Failure counting and lockout for one identifier class.
///
/// An identifier locks once its failures inside the window reach the
/// limit; progressive mode doubles the lockout duration on each
/// consecutive lockout.
pub struct LockoutService {
    limit: u32,
    window: Duration,
    base_lockout: Duration,
    progressive: bool,
    state: Mutex<HashMap<String, LockoutState>>,
}

impl LockoutService {
    pub fn new(limit: u32, window: Duration, base_lockout: Duration, progressive: bool) -> Self {
        Self {
            limit: limit.max(1),
            window,
            base_lockout,
            progressive,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure. Returns true when this failure locked the
    /// identifier.
    pub fn record_failure(&self, key: &str, now_ms: u64) -> bool {
        let mut state = self.state.lock();
        let entry = state.entry(key.to_owned()).or_default();
        let cutoff = now_ms.saturating_sub(self.window.as_millis() as u64);
        while entry.failures.front().is_some_and(|&t| t < cutoff) {
            entry.failures.pop_front();
        }
        entry.failures.push_back(now_ms);

        if entry.failures.len() as u32 >= self.limit && entry.locked_until_ms <= now_ms {
            let factor = if self.progressive {
                1u64 << entry.consecutive_lockouts.min(6)
            } else {
                1
            };
            entry.locked_until_ms = now_ms + self.base_lockout.as_millis() as u64 * factor;
            entry.consecutive_lockouts += 1;
            entry.failures.clear();
            tracing::warn!(key, until_ms = entry.locked_until_ms, "identifier locked out");
            return true;
        }
        false
    }

    /// Clear failure history after a success.
    pub fn record_success(&self, key: &str) {
        let mut state = self.state.lock();
        if let Some(entry) = state.get_mut(key) {
            entry.failures.clear();
            entry.consecutive_lockouts = 0;
        }
    }

    pub fn is_locked(&self, key: &str, now_ms: u64) -> bool {
        self.state.lock().get(key).is_some_and(|e| e.locked_until_ms > now_ms)
    }

    pub fn locked_until(&self, key: &str) -> Option<u64> {
        self.state.lock().get(key).map(|e| e.locked_until_ms).filter(|&t| t > 0)
    }

    /// Failure counting is monotonic within a window: recorded failures
    /// only accumulate until the window slides past them.
    pub fn failure_count(&self, key: &str, now_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(self.window.as_millis() as u64);
        self.state
            .lock()
            .get(key)
            .map(|e| e.failures.iter().filter(|&&t| t >= cutoff).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
#[path = "attempts_tests.rs"]
mod tests;
