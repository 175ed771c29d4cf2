// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Core-side rate limiting for safety-relevant operations.
//!
//! HTTP-level rate limiting is the collaborator's job; the core still
//! enforces the per-principal caps for safety operations, emergency
//! operations, and PIN attempts as defense in depth. Counting uses
//! sliding windows and is monotonically non-decreasing within a window.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use canlink::frame::epoch_ms;

use crate::config::{ip_in_networks, RateLimitPolicy};
use crate::error::{CoreError, CoreResult};

/// Operation category with its own limit and window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateCategory {
    General,
    SafetyOps,
    EmergencyOps,
    PinAttempts,
}

impl RateCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::SafetyOps => "safety_ops",
            Self::EmergencyOps => "emergency_ops",
            Self::PinAttempts => "pin_attempts",
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Sliding-window rate limiter over the configured policy.
pub struct RateLimiter {
    policy: RateLimitPolicy,
    windows: Mutex<HashMap<(RateCategory, String), VecDeque<u64>>>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self { policy, windows: Mutex::new(HashMap::new()) }
    }

    fn limit_and_window(&self, category: RateCategory) -> (u32, Duration) {
        match category {
            RateCategory::General => {
                (self.policy.requests_per_minute, Duration::from_secs(60))
            }
            RateCategory::SafetyOps => {
                (self.policy.safety_ops_per_minute, Duration::from_secs(60))
            }
            RateCategory::EmergencyOps => {
                (self.policy.emergency_ops_per_hour, Duration::from_secs(3600))
            }
            RateCategory::PinAttempts => {
                (self.policy.pin_attempts_per_minute, Duration::from_secs(60))
            }
        }
    }

    /// Admit or refuse one operation for `key` (principal or address).
    ///
    /// Trusted networks bypass entirely; admins get the configured
    /// multiplier on the base limit.
    pub fn check(
        &self,
        category: RateCategory,
        key: &str,
        ip: Option<&str>,
        is_admin: bool,
    ) -> RateDecision {
        if let Some(ip) = ip {
            if ip_in_networks(ip, &self.policy.trusted_networks) {
                return RateDecision { allowed: true, remaining: u32::MAX, retry_after_ms: None };
            }
        }

        let (base_limit, window) = self.limit_and_window(category);
        let limit = if is_admin {
            (base_limit as f64 * self.policy.admin_multiplier) as u32
        } else {
            base_limit
        };

        let now = epoch_ms();
        let cutoff = now.saturating_sub(window.as_millis() as u64);
        let mut windows = self.windows.lock();
        let entries = windows.entry((category, key.to_owned())).or_default();
        while entries.front().is_some_and(|&t| t < cutoff) {
            entries.pop_front();
        }

        if entries.len() as u32 >= limit {
            let retry_after = entries
                .front()
                .map(|&oldest| (oldest + window.as_millis() as u64).saturating_sub(now))
                .unwrap_or(window.as_millis() as u64);
            tracing::debug!(category = category.as_str(), key, "rate limit exceeded");
            return RateDecision { allowed: false, remaining: 0, retry_after_ms: Some(retry_after) };
        }

        entries.push_back(now);
        RateDecision {
            allowed: true,
            remaining: limit - entries.len() as u32,
            retry_after_ms: None,
        }
    }

    /// Admission count for a key inside its current window.
    pub fn count(&self, category: RateCategory, key: &str) -> usize {
        let (_, window) = self.limit_and_window(category);
        let cutoff = epoch_ms().saturating_sub(window.as_millis() as u64);
        self.windows
            .lock()
            .get(&(category, key.to_owned()))
            .map(|entries| entries.iter().filter(|&&t| t >= cutoff).count())
            .unwrap_or(0)
    }
}

/// Check-and-error helper: refuses with `Forbidden` plus a retry hint.
pub fn enforce(
    limiter: &RateLimiter,
    category: RateCategory,
    key: &str,
    ip: Option<&str>,
    is_admin: bool,
) -> CoreResult<()> {
    let decision = limiter.check(category, key, ip, is_admin);
    if decision.allowed {
        return Ok(());
    }
    let mut err = CoreError::forbidden(format!("{} rate limit exceeded", category.as_str()));
    if let Some(retry) = decision.retry_after_ms {
        err = err.with_retry_after(Duration::from_millis(retry));
    }
    Err(err)
}

#[cfg(test)]
#[path = "ratelimit_tests.rs"]
mod tests;
