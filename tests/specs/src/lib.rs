// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared helpers for the end-to-end scenario tests in `tests/`.
//!
//! Scenarios drive a fully wired platform over loopback transports:
//! frames go in through the transport handles, and assertions read the
//! decoded broadcast, the entity map, the audit log, and the domain
//! event bus.

use std::sync::Arc;
use std::time::Duration;

use canlink::frame::CanFrame;
use coachd::test_support::TestPlatform;

/// Drive one raw frame through the inbound pipeline and wait until the
/// decoded broadcast has seen it, then yield so the entity pipeline
/// task gets its turn.
pub async fn inject_and_settle(t: &TestPlatform, interface: &str, frame: CanFrame) {
    let mut decoded = t.platform.facade.subscribe_decoded();
    let _ = t.handles[interface].inject.send(frame).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), decoded.recv()).await;
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
}

/// Fixed-credential verifier for login scenarios.
pub fn verifier_for(
    username: &'static str,
    password: &'static str,
) -> coachd::security::auth::CredentialVerifier {
    Arc::new(move |u: &str, p: &str| u == username && p == password)
}

/// Wait for a domain event matching the predicate, with a bounded
/// deadline.
pub async fn wait_for_event(
    rx: &mut tokio::sync::broadcast::Receiver<coachd::events::DomainEvent>,
    mut matches: impl FnMut(&coachd::events::DomainEvent) -> bool,
) -> Option<coachd::events::DomainEvent> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(event)) if matches(&event) => return Some(event),
            Ok(Ok(_)) => continue,
            Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => continue,
            _ => return None,
        }
    }
}
