// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn stays_closed_below_threshold() {
    let breaker = CircuitBreaker::new(3, Duration::from_secs(5));
    breaker.record_failure();
    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Closed);
    breaker.admit().unwrap();
}

#[test]
fn opens_at_threshold_and_rejects() {
    let breaker = CircuitBreaker::new(3, Duration::from_secs(5));
    for _ in 0..3 {
        breaker.record_failure();
    }
    assert_eq!(breaker.state(), BreakerState::Open);
    let err = breaker.admit().unwrap_err();
    assert_eq!(err.kind, crate::error::CanErrorKind::Timeout);
    assert_eq!(breaker.trips(), 1);
}

#[test]
fn success_resets_failure_count() {
    let breaker = CircuitBreaker::new(3, Duration::from_secs(5));
    breaker.record_failure();
    breaker.record_failure();
    breaker.record_success();
    breaker.record_failure();
    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Closed);
}

#[test]
fn half_open_probe_after_cooldown() {
    let breaker = CircuitBreaker::new(1, Duration::from_millis(0));
    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Open);

    // Zero cooldown: the next admit is a half-open probe.
    breaker.admit().unwrap();
    assert_eq!(breaker.state(), BreakerState::HalfOpen);

    // Probe success closes.
    breaker.record_success();
    assert_eq!(breaker.state(), BreakerState::Closed);
}

#[test]
fn failed_probe_reopens() {
    let breaker = CircuitBreaker::new(1, Duration::from_millis(0));
    breaker.record_failure();
    breaker.admit().unwrap();
    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Open);
    assert_eq!(breaker.trips(), 2);
}
