// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token-bearer sessions with device-fingerprint pinning.
//!
//! No authentication protocol is invented here: a deployment plugs in a
//! credential verifier and this service handles lockout, attempt
//! tracking, opaque token issue/refresh, and fingerprint checks.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use canlink::frame::epoch_ms;

use crate::error::{CoreError, CoreResult};
use crate::repository::auth::{AuthRepository, Session};
use crate::security::attempts::{
    AttemptKind, AttemptOutcome, LockoutService, SecurityAttempt, SecurityOrchestrator,
};
use crate::security::AuthContext;

/// Default session lifetime (8 hours).
pub const SESSION_TTL: Duration = Duration::from_secs(8 * 3600);

/// Deployment-provided credential verifier.
pub type CredentialVerifier = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Stable device fingerprint: sha256 of the user agent and the /24
/// subnet of the source address.
pub fn fingerprint(user_agent: &str, ip: &str) -> String {
    let subnet = ip.rsplit_once('.').map(|(prefix, _)| prefix).unwrap_or(ip);
    let mut hasher = Sha256::new();
    hasher.update(user_agent.as_bytes());
    hasher.update(b"|");
    hasher.update(subnet.as_bytes());
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn new_token() -> String {
    let bytes: [u8; 32] = rand::random();
    hex(&bytes)
}

/// Login, refresh, and validation over the session store.
pub struct SessionService {
    sessions: Arc<AuthRepository>,
    orchestrator: Arc<SecurityOrchestrator>,
    lockout: Arc<LockoutService>,
    verifier: CredentialVerifier,
    default_scopes: HashSet<String>,
}

impl SessionService {
    pub fn new(
        sessions: Arc<AuthRepository>,
        orchestrator: Arc<SecurityOrchestrator>,
        lockout: Arc<LockoutService>,
        verifier: CredentialVerifier,
        default_scopes: HashSet<String>,
    ) -> Self {
        Self { sessions, orchestrator, lockout, verifier, default_scopes }
    }

    fn lockout_key(username: &str, ip: &str) -> String {
        format!("{username}|{ip}")
    }

    /// Authenticate and issue a session.
    ///
    /// A locked account fails immediately without consulting
    /// credentials; the attempt is still tracked.
    pub fn login(
        &self,
        username: &str,
        password: &str,
        ip: &str,
        user_agent: &str,
    ) -> CoreResult<Session> {
        let now = epoch_ms();
        let key = Self::lockout_key(username, ip);

        if self.lockout.is_locked(&key, now) {
            self.orchestrator.track(
                SecurityAttempt::new(AttemptKind::Login, AttemptOutcome::Blocked)
                    .principal(username)
                    .ip(ip)
                    .user_agent(user_agent)
                    .reason("account_locked"),
            );
            return Err(CoreError::forbidden("account locked"));
        }

        if !(self.verifier)(username, password) {
            self.orchestrator.track(
                SecurityAttempt::new(AttemptKind::Login, AttemptOutcome::Failed)
                    .principal(username)
                    .ip(ip)
                    .user_agent(user_agent)
                    .reason("invalid_credentials"),
            );
            self.lockout.record_failure(&key, now);
            return Err(CoreError::forbidden("invalid credentials"));
        }

        self.lockout.record_success(&key);
        self.orchestrator.track(
            SecurityAttempt::new(AttemptKind::Login, AttemptOutcome::Success)
                .principal(username)
                .ip(ip)
                .user_agent(user_agent),
        );

        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            token: new_token(),
            principal: username.to_owned(),
            scopes: self.default_scopes.clone(),
            fingerprint: fingerprint(user_agent, ip),
            created_ms: now,
            expires_ms: now + SESSION_TTL.as_millis() as u64,
        };
        self.sessions.insert(session.clone());
        tracing::info!(principal = username, session = %session.session_id, "session issued");
        Ok(session)
    }

    /// Validate a bearer token and build the caller's auth context.
    pub fn validate(&self, token: &str, ip: &str, user_agent: &str) -> CoreResult<AuthContext> {
        let now = epoch_ms();
        let session = self
            .sessions
            .validate(token, &fingerprint(user_agent, ip), now)
            .inspect_err(|_| {
                self.orchestrator.track(
                    SecurityAttempt::new(AttemptKind::UnauthorizedAccess, AttemptOutcome::Failed)
                        .ip(ip)
                        .user_agent(user_agent)
                        .reason("invalid_token"),
                );
            })?;
        Ok(AuthContext::from_session(&session, Some(ip.to_owned())))
    }

    /// Rotate the access token, preserving the session.
    pub fn refresh(&self, token: &str, ip: &str, user_agent: &str) -> CoreResult<Session> {
        let now = epoch_ms();
        // Fingerprint check happens before the rotation.
        let current = self.sessions.validate(token, &fingerprint(user_agent, ip), now)?;
        let refreshed = self.sessions.refresh(
            &current.token,
            new_token(),
            now + SESSION_TTL.as_millis() as u64,
        )?;
        self.orchestrator.track(
            SecurityAttempt::new(AttemptKind::TokenRefresh, AttemptOutcome::Success)
                .principal(refreshed.principal.clone())
                .ip(ip),
        );
        Ok(refreshed)
    }

    /// Destroy a session.
    pub fn logout(&self, token: &str) {
        self.sessions.remove(token);
    }
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
