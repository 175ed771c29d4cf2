// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn repo() -> SecurityAuditRepository {
    SecurityAuditRepository::new(PerfMonitor::new(), RetentionPolicy::default())
}

#[test]
fn append_assigns_increasing_seq() {
    let repo = repo();
    let a = repo.append(AuditKind::Injection, None, serde_json::json!({}), false);
    let b = repo.append(AuditKind::Injection, None, serde_json::json!({}), false);
    assert!(b > a);
    assert_eq!(repo.len(), 2);
}

#[test]
fn queries_filter_without_mutating() {
    let repo = repo();
    repo.append(AuditKind::EntityControlBlocked, Some("op".to_owned()), serde_json::json!({"reason": "vehicle_in_motion"}), false);
    repo.append(AuditKind::EmergencyStopInitiated, None, serde_json::json!({}), true);

    let blocked = repo.by_kind(AuditKind::EntityControlBlocked);
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].principal.as_deref(), Some("op"));
    assert_eq!(repo.len(), 2, "queries never mutate history");
}

#[test]
fn prune_respects_split_retention() {
    let repo = repo();
    repo.append(AuditKind::SecurityAttempt, None, serde_json::json!({}), false);
    repo.append(AuditKind::EmergencyStopInitiated, None, serde_json::json!({}), true);

    // One year + a day later the normal entry ages out, compliance stays.
    let now = epoch_ms() + 366 * DAY_MS;
    let removed = repo.prune(now);
    assert_eq!(removed, 1);
    let remaining = repo.all();
    assert_eq!(remaining.len(), 1);
    assert!(remaining[0].compliance);
}

#[test]
fn operations_are_instrumented() {
    let monitor = PerfMonitor::new();
    let repo = SecurityAuditRepository::new(monitor.clone(), RetentionPolicy::default());
    repo.append(AuditKind::Injection, None, serde_json::json!({}), false);
    repo.all();
    assert_eq!(monitor.stats("audit.append").unwrap().count, 1);
    assert_eq!(monitor.stats("audit.all").unwrap().count, 1);
}
