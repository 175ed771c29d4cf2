// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn records_counts_and_latency() {
    let monitor = PerfMonitor::new();
    monitor.record("entity.get", Duration::from_micros(100), true);
    monitor.record("entity.get", Duration::from_micros(300), true);
    monitor.record("entity.get", Duration::from_micros(200), false);

    let stats = monitor.stats("entity.get").unwrap();
    assert_eq!(stats.count, 3);
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.total_us, 600);
    assert_eq!(stats.max_us, 300);
    assert_eq!(stats.mean_us(), 200);
}

#[test]
fn time_wraps_closures() {
    let monitor = PerfMonitor::new();
    let value = monitor.time("op", || 42);
    assert_eq!(value, 42);
    assert_eq!(monitor.stats("op").unwrap().count, 1);

    let result: Result<(), &str> = monitor.time_result("op", || Err("boom"));
    assert!(result.is_err());
    let stats = monitor.stats("op").unwrap();
    assert_eq!(stats.count, 2);
    assert_eq!(stats.errors, 1);
}

#[test]
fn snapshot_orders_slowest_first() {
    let monitor = PerfMonitor::new();
    monitor.record("fast", Duration::from_micros(10), true);
    monitor.record("slow", Duration::from_micros(10_000), true);
    monitor.record("medium", Duration::from_micros(500), true);

    let snapshot = monitor.snapshot();
    assert_eq!(snapshot.slowest[0], "slow");
    assert_eq!(snapshot.operations.len(), 3);
}

#[test]
fn clones_share_state() {
    let monitor = PerfMonitor::new();
    let clone = monitor.clone();
    clone.record("op", Duration::from_micros(1), true);
    assert_eq!(monitor.stats("op").unwrap().count, 1);
}
