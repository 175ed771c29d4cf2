// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Security event orchestration.
//!
//! Aggregates authentication, PIN, rate-limit, and safety-operation
//! attempts into one append-only stream, runs pattern checks over a
//! sliding window, computes per-principal risk scores, and publishes
//! threat events. Lockout and token-session handling live here too.

pub mod attempts;
pub mod auth;
pub mod ratelimit;

pub use attempts::{
    AttemptKind, AttemptOutcome, AttemptSummary, LockoutService, RiskAssessment,
    SecurityAttempt, SecurityOrchestrator,
};
pub use auth::{fingerprint, SessionService};
pub use ratelimit::{RateCategory, RateLimiter};

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::repository::auth::Session;

/// Threat severity tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// One tier up, saturating at critical.
    pub fn bump(&self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High => Self::Critical,
            Self::Critical => Self::Critical,
        }
    }
}

/// The authenticated caller of a core operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthContext {
    pub principal: String,
    pub scopes: HashSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
}

impl AuthContext {
    pub fn new(principal: impl Into<String>, scopes: impl IntoIterator<Item = String>) -> Self {
        Self { principal: principal.into(), scopes: scopes.into_iter().collect(), source_ip: None }
    }

    pub fn from_session(session: &Session, source_ip: Option<String>) -> Self {
        Self { principal: session.principal.clone(), scopes: session.scopes.clone(), source_ip }
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }
}
