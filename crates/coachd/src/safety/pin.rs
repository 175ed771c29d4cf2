// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Operator PIN validation.
//!
//! PINs come in three classes (emergency / override / maintenance) with
//! their own session lifetimes and a shared progressive lockout. A
//! successful validation mints a short-lived session scoped to the
//! authorizing class; every attempt is tracked as a security event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use canlink::frame::epoch_ms;

use crate::config::{PinClass, PinDefinition, PinPolicy};
use crate::error::{CoreError, CoreResult};
use crate::security::attempts::{
    AttemptKind, AttemptOutcome, LockoutService, SecurityAttempt, SecurityOrchestrator,
};
use crate::security::ratelimit::{RateCategory, RateLimiter};

/// A short-lived PIN authorization session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinSession {
    pub id: String,
    pub class: PinClass,
    pub principal: String,
    pub issued_ms: u64,
    pub expires_ms: u64,
}

/// Validates PINs and manages their authorization sessions.
pub struct PinManager {
    policy: PinPolicy,
    digests: HashMap<PinClass, Vec<String>>,
    lockout: LockoutService,
    sessions: Mutex<HashMap<String, PinSession>>,
    orchestrator: Arc<SecurityOrchestrator>,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl PinManager {
    pub fn new(
        policy: PinPolicy,
        pins: &[PinDefinition],
        orchestrator: Arc<SecurityOrchestrator>,
    ) -> Self {
        Self::with_rate_limiter(policy, pins, orchestrator, None)
    }

    pub fn with_rate_limiter(
        policy: PinPolicy,
        pins: &[PinDefinition],
        orchestrator: Arc<SecurityOrchestrator>,
        rate_limiter: Option<Arc<RateLimiter>>,
    ) -> Self {
        let mut digests: HashMap<PinClass, Vec<String>> = HashMap::new();
        for pin in pins {
            digests.entry(pin.class).or_default().push(pin.digest.to_lowercase());
        }
        let lockout = LockoutService::new(
            policy.max_failed_attempts,
            Duration::from_secs(15 * 60),
            policy.lockout_duration(),
            policy.progressive_lockout,
        );
        Self {
            policy,
            digests,
            lockout,
            sessions: Mutex::new(HashMap::new()),
            orchestrator,
            rate_limiter,
        }
    }

    fn session_ttl(&self, class: PinClass) -> Duration {
        let minutes = match class {
            PinClass::Emergency => self.policy.emergency_session_minutes,
            PinClass::Override => self.policy.override_session_minutes,
            PinClass::Maintenance => self.policy.maintenance_session_minutes,
        };
        Duration::from_secs(minutes * 60)
    }

    fn digest(pin: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(pin.as_bytes());
        hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Validate a PIN of the given class for a principal.
    pub fn validate(&self, principal: &str, class: PinClass, pin: &str) -> CoreResult<PinSession> {
        let now = epoch_ms();
        let key = format!("{principal}|{}", class.as_str());

        if let Some(ref limiter) = self.rate_limiter {
            let decision = limiter.check(RateCategory::PinAttempts, principal, None, false);
            if !decision.allowed {
                self.orchestrator.track(
                    SecurityAttempt::new(AttemptKind::Pin, AttemptOutcome::RateLimited)
                        .principal(principal)
                        .reason("pin_rate_limited")
                        .safety(),
                );
                let mut err = CoreError::forbidden("pin attempts rate limited");
                if let Some(retry) = decision.retry_after_ms {
                    err = err.with_retry_after(Duration::from_millis(retry));
                }
                return Err(err);
            }
        }

        if self.lockout.is_locked(&key, now) {
            self.orchestrator.track(
                SecurityAttempt::new(AttemptKind::Pin, AttemptOutcome::Blocked)
                    .principal(principal)
                    .reason("pin_locked")
                    .safety(),
            );
            return Err(CoreError::forbidden("pin validation locked"));
        }

        let valid = pin.len() >= self.policy.min_length as usize
            && self
                .digests
                .get(&class)
                .map(|digests| digests.contains(&Self::digest(pin)))
                .unwrap_or(false);

        if !valid {
            self.orchestrator.track(
                SecurityAttempt::new(AttemptKind::Pin, AttemptOutcome::Failed)
                    .principal(principal)
                    .reason("invalid_pin")
                    .safety(),
            );
            self.lockout.record_failure(&key, now);
            return Err(CoreError::forbidden("invalid pin"));
        }

        self.lockout.record_success(&key);
        self.orchestrator.track(
            SecurityAttempt::new(AttemptKind::Pin, AttemptOutcome::Success)
                .principal(principal)
                .safety(),
        );

        let session = PinSession {
            id: Uuid::new_v4().to_string(),
            class,
            principal: principal.to_owned(),
            issued_ms: now,
            expires_ms: now + self.session_ttl(class).as_millis() as u64,
        };
        self.sessions.lock().insert(session.id.clone(), session.clone());
        tracing::info!(principal, class = class.as_str(), session = %session.id, "pin session issued");
        Ok(session)
    }

    /// Check that a session exists, is live, and carries the required
    /// class.
    pub fn authorize(&self, session_id: &str, class: PinClass) -> CoreResult<PinSession> {
        let now = epoch_ms();
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| CoreError::forbidden("unknown pin session"))?;
        if session.expires_ms <= now {
            sessions.remove(session_id);
            return Err(CoreError::forbidden("pin session expired"));
        }
        if session.class != class {
            return Err(CoreError::forbidden(format!(
                "operation requires a {} pin",
                class.as_str()
            )));
        }
        Ok(session)
    }

    pub fn revoke(&self, session_id: &str) {
        self.sessions.lock().remove(session_id);
    }

    pub fn prune_expired(&self, now_ms: u64) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| s.expires_ms > now_ms);
        before - sessions.len()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[cfg(test)]
#[path = "pin_tests.rs"]
mod tests;
