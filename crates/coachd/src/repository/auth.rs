// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session store for token-bearer authentication.
//!
//! Sessions are keyed by the opaque access token. A refresh rotates the
//! access token but preserves the session identity; a device-fingerprint
//! mismatch on use is a hard failure that destroys the session.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::monitor::PerfMonitor;

/// An authenticated session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Stable session identity, preserved across refreshes.
    pub session_id: String,
    /// Current opaque access token.
    pub token: String,
    pub principal: String,
    pub scopes: HashSet<String>,
    /// Stable hash of user-agent + IP subnet.
    pub fingerprint: String,
    pub created_ms: u64,
    pub expires_ms: u64,
}

/// Owner of the session store.
pub struct AuthRepository {
    monitor: PerfMonitor,
    sessions: Mutex<HashMap<String, Session>>,
}

impl AuthRepository {
    pub fn new(monitor: PerfMonitor) -> Self {
        Self { monitor, sessions: Mutex::new(HashMap::new()) }
    }

    pub fn insert(&self, session: Session) {
        self.monitor.time("auth_repo.insert", || {
            self.sessions.lock().insert(session.token.clone(), session);
        })
    }

    pub fn get(&self, token: &str) -> Option<Session> {
        self.monitor.time("auth_repo.get", || self.sessions.lock().get(token).cloned())
    }

    pub fn remove(&self, token: &str) -> Option<Session> {
        self.monitor.time("auth_repo.remove", || self.sessions.lock().remove(token))
    }

    /// Validate a token for use.
    ///
    /// Expired tokens are removed and fail. A fingerprint mismatch is a
    /// hard failure: the session is destroyed, never retried.
    pub fn validate(&self, token: &str, fingerprint: &str, now_ms: u64) -> CoreResult<Session> {
        self.monitor.time_result("auth_repo.validate", || {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .get(token)
                .cloned()
                .ok_or_else(|| CoreError::forbidden("unknown session token"))?;
            if session.expires_ms <= now_ms {
                sessions.remove(token);
                return Err(CoreError::forbidden("session expired"));
            }
            if session.fingerprint != fingerprint {
                sessions.remove(token);
                tracing::warn!(principal = %session.principal, "session fingerprint mismatch, session destroyed");
                return Err(CoreError::forbidden("device fingerprint mismatch"));
            }
            Ok(session)
        })
    }

    /// Rotate the access token, preserving the session.
    pub fn refresh(&self, token: &str, new_token: String, new_expires_ms: u64) -> CoreResult<Session> {
        self.monitor.time_result("auth_repo.refresh", || {
            let mut sessions = self.sessions.lock();
            let mut session = sessions
                .remove(token)
                .ok_or_else(|| CoreError::forbidden("unknown session token"))?;
            session.token = new_token.clone();
            session.expires_ms = new_expires_ms;
            sessions.insert(new_token, session.clone());
            Ok(session)
        })
    }

    /// Drop expired sessions. Returns removed count.
    pub fn prune_expired(&self, now_ms: u64) -> usize {
        self.monitor.time("auth_repo.prune_expired", || {
            let mut sessions = self.sessions.lock();
            let before = sessions.len();
            sessions.retain(|_, s| s.expires_ms > now_ms);
            before - sessions.len()
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
