// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn limiter() -> RateLimiter {
    RateLimiter::new(RateLimitPolicy::default())
}

#[test]
fn allows_until_limit() {
    let limiter = limiter();
    // Default safety ops: 5 per minute.
    for i in 0..5 {
        let decision = limiter.check(RateCategory::SafetyOps, "operator", None, false);
        assert!(decision.allowed, "attempt {i} should pass");
    }
    let decision = limiter.check(RateCategory::SafetyOps, "operator", None, false);
    assert!(!decision.allowed);
    assert!(decision.retry_after_ms.is_some());
}

#[test]
fn keys_are_independent() {
    let limiter = limiter();
    for _ in 0..5 {
        limiter.check(RateCategory::SafetyOps, "alice", None, false);
    }
    assert!(!limiter.check(RateCategory::SafetyOps, "alice", None, false).allowed);
    assert!(limiter.check(RateCategory::SafetyOps, "bob", None, false).allowed);
}

#[test]
fn categories_are_independent() {
    let limiter = limiter();
    for _ in 0..5 {
        limiter.check(RateCategory::SafetyOps, "alice", None, false);
    }
    assert!(limiter.check(RateCategory::PinAttempts, "alice", None, false).allowed);
}

#[test]
fn admin_multiplier_raises_limit() {
    let limiter = limiter();
    // 5 * 2.0 = 10 safety ops for admins.
    for i in 0..10 {
        assert!(
            limiter.check(RateCategory::SafetyOps, "admin", None, true).allowed,
            "admin attempt {i}"
        );
    }
    assert!(!limiter.check(RateCategory::SafetyOps, "admin", None, true).allowed);
}

#[test]
fn trusted_networks_bypass() {
    let mut policy = RateLimitPolicy::default();
    policy.trusted_networks = vec!["10.0.0.0/8".to_owned()];
    let limiter = RateLimiter::new(policy);
    for _ in 0..100 {
        assert!(limiter
            .check(RateCategory::PinAttempts, "k", Some("10.1.2.3"), false)
            .allowed);
    }
    // Outside the trusted range, the limit applies (3/min).
    for _ in 0..3 {
        limiter.check(RateCategory::PinAttempts, "k", Some("192.168.1.1"), false);
    }
    assert!(!limiter.check(RateCategory::PinAttempts, "k", Some("192.168.1.1"), false).allowed);
}

#[test]
fn counting_is_monotonic_within_window() {
    let limiter = limiter();
    let mut last = 0;
    for _ in 0..8 {
        limiter.check(RateCategory::General, "k", None, false);
        let count = limiter.count(RateCategory::General, "k");
        assert!(count >= last);
        last = count;
    }
    assert_eq!(last, 8);
}

#[test]
fn enforce_maps_to_forbidden_with_retry() {
    let limiter = limiter();
    for _ in 0..3 {
        enforce(&limiter, RateCategory::PinAttempts, "op", None, false).unwrap();
    }
    let err = enforce(&limiter, RateCategory::PinAttempts, "op", None, false).unwrap_err();
    assert_eq!(err.kind, crate::error::ErrorKind::Forbidden);
    assert!(err.retry_after_ms.is_some());
}
