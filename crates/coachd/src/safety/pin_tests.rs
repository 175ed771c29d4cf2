// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::config::RetentionPolicy;
use crate::events::EventBus;
use crate::monitor::PerfMonitor;
use crate::repository::audit::SecurityAuditRepository;
use crate::security::attempts::PatternThresholds;

fn manager_with(pins: &[(PinClass, &str)]) -> PinManager {
    let audit = Arc::new(SecurityAuditRepository::new(
        PerfMonitor::new(),
        RetentionPolicy::default(),
    ));
    let orchestrator = Arc::new(SecurityOrchestrator::new(
        PatternThresholds::default(),
        audit,
        EventBus::default(),
    ));
    let definitions: Vec<PinDefinition> = pins
        .iter()
        .map(|(class, pin)| PinDefinition { class: *class, digest: PinManager::digest(pin) })
        .collect();
    PinManager::new(PinPolicy::default(), &definitions, orchestrator)
}

#[test]
fn valid_pin_issues_classed_session() {
    let manager = manager_with(&[(PinClass::Override, "4711")]);
    let session = manager.validate("operator", PinClass::Override, "4711").unwrap();
    assert_eq!(session.class, PinClass::Override);
    // Override sessions live 15 minutes by default.
    assert_eq!(session.expires_ms - session.issued_ms, 15 * 60 * 1000);

    let authorized = manager.authorize(&session.id, PinClass::Override).unwrap();
    assert_eq!(authorized.principal, "operator");
}

#[test]
fn class_ttls_differ() {
    let manager = manager_with(&[
        (PinClass::Emergency, "9111"),
        (PinClass::Maintenance, "8222"),
    ]);
    let emergency = manager.validate("op", PinClass::Emergency, "9111").unwrap();
    assert_eq!(emergency.expires_ms - emergency.issued_ms, 5 * 60 * 1000);
    let maintenance = manager.validate("op", PinClass::Maintenance, "8222").unwrap();
    assert_eq!(maintenance.expires_ms - maintenance.issued_ms, 30 * 60 * 1000);
}

#[test]
fn wrong_pin_fails() {
    let manager = manager_with(&[(PinClass::Override, "4711")]);
    let err = manager.validate("operator", PinClass::Override, "9999").unwrap_err();
    assert_eq!(err.kind, crate::error::ErrorKind::Forbidden);
}

#[test]
fn wrong_class_fails() {
    let manager = manager_with(&[(PinClass::Override, "4711")]);
    assert!(manager.validate("operator", PinClass::Emergency, "4711").is_err());
}

#[test]
fn short_pin_rejected_even_if_digest_matches() {
    let manager = manager_with(&[(PinClass::Override, "47")]);
    assert!(manager.validate("operator", PinClass::Override, "47").is_err());
}

#[test]
fn three_failures_lock_the_class() {
    let manager = manager_with(&[(PinClass::Override, "4711")]);
    for _ in 0..3 {
        let _ = manager.validate("operator", PinClass::Override, "bad-pin");
    }
    let err = manager.validate("operator", PinClass::Override, "4711").unwrap_err();
    assert!(err.message.contains("locked"));
}

#[test]
fn authorize_enforces_exact_class() {
    let manager = manager_with(&[(PinClass::Maintenance, "8222")]);
    let session = manager.validate("op", PinClass::Maintenance, "8222").unwrap();
    let err = manager.authorize(&session.id, PinClass::Override).unwrap_err();
    assert!(err.message.contains("override"));
}

#[test]
fn expired_sessions_prune() {
    let manager = manager_with(&[(PinClass::Override, "4711")]);
    let session = manager.validate("op", PinClass::Override, "4711").unwrap();
    assert_eq!(manager.prune_expired(session.expires_ms + 1), 1);
    assert!(manager.authorize(&session.id, PinClass::Override).is_err());
}

#[test]
fn pin_attempts_are_rate_limited() {
    let audit = Arc::new(SecurityAuditRepository::new(
        PerfMonitor::new(),
        crate::config::RetentionPolicy::default(),
    ));
    let orchestrator = Arc::new(SecurityOrchestrator::new(
        crate::security::attempts::PatternThresholds::default(),
        audit,
        EventBus::default(),
    ));
    let limiter = Arc::new(RateLimiter::new(crate::config::RateLimitPolicy::default()));
    let manager = PinManager::with_rate_limiter(
        PinPolicy::default(),
        &[PinDefinition { class: PinClass::Override, digest: PinManager::digest("4711") }],
        orchestrator,
        Some(limiter),
    );

    // Default policy allows 3 PIN attempts per minute.
    for _ in 0..3 {
        manager.validate("operator", PinClass::Override, "4711").unwrap();
    }
    let err = manager.validate("operator", PinClass::Override, "4711").unwrap_err();
    assert!(err.message.contains("rate limited"));
    assert!(err.retry_after_ms.is_some());
}

#[test]
fn revoked_session_is_gone() {
    let manager = manager_with(&[(PinClass::Override, "4711")]);
    let session = manager.validate("op", PinClass::Override, "4711").unwrap();
    manager.revoke(&session.id);
    assert!(manager.authorize(&session.id, PinClass::Override).is_err());
}
