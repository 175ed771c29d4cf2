// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::config::RetentionPolicy;
use crate::monitor::PerfMonitor;
use proptest::prelude::*;

fn orchestrator() -> (Arc<SecurityOrchestrator>, EventBus) {
    let events = EventBus::default();
    let audit = Arc::new(SecurityAuditRepository::new(
        PerfMonitor::new(),
        RetentionPolicy::default(),
    ));
    (
        Arc::new(SecurityOrchestrator::new(PatternThresholds::default(), audit, events.clone())),
        events,
    )
}

fn failed_login(principal: &str, ip: &str, ts: u64) -> SecurityAttempt {
    let mut attempt = SecurityAttempt::new(AttemptKind::Login, AttemptOutcome::Failed)
        .principal(principal)
        .ip(ip)
        .reason("invalid_credentials");
    attempt.timestamp_ms = ts;
    attempt
}

#[test]
fn summary_aggregates_outcomes() {
    let (orch, _) = orchestrator();
    let now = 1_000_000;
    for i in 0..3u64 {
        orch.track(failed_login("alice", "10.0.0.1", now + i));
    }
    let mut ok = SecurityAttempt::new(AttemptKind::Login, AttemptOutcome::Success).principal("alice").ip("10.0.0.2");
    ok.timestamp_ms = now + 10;
    orch.track(ok);

    let summary = orch.summary("alice", Duration::from_secs(900), now + 100);
    assert_eq!(summary.total, 4);
    assert_eq!(summary.failed, 3);
    assert_eq!(summary.successes, 1);
    assert_eq!(summary.unique_ips, 2);
}

#[test]
fn sixth_failed_login_publishes_high_threat() {
    let (orch, events) = orchestrator();
    let mut rx = events.subscribe();
    let now = 1_000_000;

    for i in 0..6u64 {
        orch.track(failed_login("bob", "10.0.0.9", now + i));
    }

    let threat = std::iter::from_fn(|| rx.try_recv().ok())
        .find_map(|e| match e {
            DomainEvent::SecurityThreat { severity, pattern, principal, .. } => {
                Some((severity, pattern, principal))
            }
            _ => None,
        })
        .unwrap();
    assert_eq!(threat.0, ThreatSeverity::High);
    assert_eq!(threat.1, "excessive_failed_logins");
    assert_eq!(threat.2.as_deref(), Some("bob"));
}

#[test]
fn five_failed_logins_stay_quiet() {
    let (orch, events) = orchestrator();
    let mut rx = events.subscribe();
    for i in 0..5u64 {
        orch.track(failed_login("bob", "10.0.0.9", 1_000_000 + i));
    }
    assert!(rx.try_recv().is_err());
}

#[test]
fn safety_endpoint_threats_are_at_least_high() {
    let (orch, events) = orchestrator();
    let mut rx = events.subscribe();
    let now = 1_000_000;

    // Rate-limit pattern alone carries medium severity.
    for i in 0..11u64 {
        let mut attempt = SecurityAttempt::new(AttemptKind::RateLimit, AttemptOutcome::RateLimited)
            .principal("carol")
            .ip("10.0.0.3")
            .safety();
        attempt.timestamp_ms = now + i;
        orch.track(attempt);
    }

    let severity = std::iter::from_fn(|| rx.try_recv().ok())
        .find_map(|e| match e {
            DomainEvent::SecurityThreat { severity, pattern, .. }
                if pattern == "excessive_rate_limiting" =>
            {
                Some(severity)
            }
            _ => None,
        })
        .unwrap();
    assert!(severity >= ThreatSeverity::High);
}

#[test]
fn distributed_attack_on_many_ips() {
    let (orch, events) = orchestrator();
    let mut rx = events.subscribe();
    let now = 1_000_000;
    for i in 0..6u64 {
        orch.track(failed_login("dave", &format!("10.0.{i}.1"), now + i));
    }
    let found = std::iter::from_fn(|| rx.try_recv().ok()).any(|e| {
        matches!(e, DomainEvent::SecurityThreat { pattern, .. } if pattern == "distributed_attack")
    });
    assert!(found);
}

#[test]
fn risk_score_weights_and_tiers() {
    let (orch, _) = orchestrator();
    let now = 1_000_000;
    // 3 recent failures: 30 points -> medium.
    for i in 0..3u64 {
        orch.track(failed_login("erin", "10.0.0.1", now + i));
    }
    let risk = orch.risk_score("erin", now + 100);
    assert_eq!(risk.score, 30);
    assert_eq!(risk.level, ThreatSeverity::Medium);

    // 5 blocks add 100 points -> critical.
    for i in 0..5u64 {
        let mut attempt = SecurityAttempt::new(AttemptKind::Login, AttemptOutcome::Blocked)
            .principal("erin")
            .ip("10.0.0.1");
        attempt.timestamp_ms = now + 10 + i;
        orch.track(attempt);
    }
    let risk = orch.risk_score("erin", now + 100);
    assert!(risk.score >= 100);
    assert_eq!(risk.level, ThreatSeverity::Critical);
}

#[test]
fn lockout_after_limit_and_progressive_doubling() {
    let lockout = LockoutService::new(3, Duration::from_secs(900), Duration::from_secs(900), true);
    let now = 1_000_000;

    assert!(!lockout.record_failure("u|ip", now));
    assert!(!lockout.record_failure("u|ip", now + 1));
    assert!(lockout.record_failure("u|ip", now + 2), "third failure locks");
    assert!(lockout.is_locked("u|ip", now + 3));
    let first_until = lockout.locked_until("u|ip").unwrap();
    assert_eq!(first_until, now + 2 + 900_000);

    // After expiry, the next lockout doubles.
    let later = first_until + 1;
    assert!(!lockout.is_locked("u|ip", later));
    for i in 0..3u64 {
        lockout.record_failure("u|ip", later + i);
    }
    let second_until = lockout.locked_until("u|ip").unwrap();
    assert_eq!(second_until, later + 2 + 1_800_000);
}

#[test]
fn success_resets_failure_count() {
    let lockout = LockoutService::new(3, Duration::from_secs(900), Duration::from_secs(900), false);
    let now = 1_000_000;
    lockout.record_failure("k", now);
    lockout.record_failure("k", now + 1);
    lockout.record_success("k");
    assert!(!lockout.record_failure("k", now + 2));
    assert_eq!(lockout.failure_count("k", now + 2), 1);
}

#[test]
fn window_slides_old_failures_out() {
    let lockout = LockoutService::new(3, Duration::from_secs(900), Duration::from_secs(900), false);
    let now = 10_000_000;
    lockout.record_failure("k", now);
    lockout.record_failure("k", now + 1);
    // 16 minutes later the earlier failures are out of the window.
    assert!(!lockout.record_failure("k", now + 960_000));
    assert_eq!(lockout.failure_count("k", now + 960_000), 1);
}

proptest! {
    // Attempt counting within a window is monotonically non-decreasing
    // as attempts accumulate.
    #[test]
    fn attempt_counts_are_monotonic(offsets in proptest::collection::vec(0u64..800_000, 1..40)) {
        let (orch, _) = orchestrator();
        let base = 10_000_000u64;
        let mut sorted = offsets.clone();
        sorted.sort_unstable();

        let mut last = 0u64;
        for offset in sorted {
            orch.track(failed_login("mallory", "10.0.0.1", base + offset));
            let summary = orch.summary("mallory", Duration::from_secs(900), base + 800_000);
            prop_assert!(summary.total >= last);
            last = summary.total;
        }
    }
}
