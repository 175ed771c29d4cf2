// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::codec::Codec;
use crate::frame::CanFrame;
use crate::spec::SpecTable;
use std::sync::Arc;

fn decoded(can_id: u32, data: Vec<u8>, ts: u64) -> DecodedFrame {
    let codec = Codec::new(Arc::new(SpecTable::builtin()));
    let mut frame = CanFrame::new("can0", can_id, data).unwrap();
    frame.timestamp_ms = ts;
    codec.decode(frame)
}

fn detector() -> AnomalyDetector {
    AnomalyDetector::new(
        AnomalyConfig {
            flood_threshold_per_sec: 10,
            rate_window_ms: 1_000,
            learning_window_ms: 5_000,
            dlc_min_samples: 3,
            channel_capacity: 64,
        },
        EmergencyFlag::new(),
    )
}

#[test]
fn quiet_traffic_raises_nothing() {
    let detector = detector();
    for i in 0..5u64 {
        let found = detector.observe(&decoded(0x18FEE800, vec![0; 8], 1000 + i * 200)).unwrap();
        assert!(found.is_empty());
    }
    assert_eq!(detector.statistics().anomalies, 0);
}

#[test]
fn flood_detected_once_until_it_clears() {
    let detector = detector();
    let mut rx = detector.subscribe();

    // 12 frames inside one second crosses the 10/s threshold.
    let mut floods = 0;
    for i in 0..12u64 {
        let found = detector.observe(&decoded(0x100, vec![0], 1000 + i * 10)).unwrap();
        floods += found
            .iter()
            .filter(|a| a.kind == AnomalyKind::MessageFlood)
            .count();
    }
    assert_eq!(floods, 1, "flood reported once while it persists");
    let anomaly = rx.try_recv().unwrap();
    assert_eq!(anomaly.kind, AnomalyKind::MessageFlood);
    assert_eq!(anomaly.severity, AnomalySeverity::Critical);

    // Rate drops below threshold, then floods again: a second report.
    detector.observe(&decoded(0x100, vec![0], 10_000)).unwrap();
    let mut floods = 0;
    for i in 0..12u64 {
        let found = detector.observe(&decoded(0x100, vec![0], 20_000 + i * 10)).unwrap();
        floods += found
            .iter()
            .filter(|a| a.kind == AnomalyKind::MessageFlood)
            .count();
    }
    assert_eq!(floods, 1);
}

#[test]
fn new_source_after_learning_window() {
    let detector = detector();

    // Source 0x10 arrives during the learning window: baseline.
    let known = crate::codec::encode_id(6, 0xFEE8, 0x10, 0xFF).unwrap();
    assert!(detector.observe(&decoded(known, vec![0; 8], 1_000)).unwrap().is_empty());

    // Source 0x66 shows up well after the window closed.
    let stranger = crate::codec::encode_id(6, 0xFEE8, 0x66, 0xFF).unwrap();
    let found = detector.observe(&decoded(stranger, vec![0; 8], 20_000)).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].kind, AnomalyKind::NewSourceAddress);
    assert_eq!(found[0].source, Some(0x66));

    // Only on first appearance.
    assert!(detector.observe(&decoded(stranger, vec![0; 8], 20_100)).unwrap().is_empty());
}

#[test]
fn dlc_change_on_established_id() {
    let detector = detector();
    for i in 0..4u64 {
        assert!(detector
            .observe(&decoded(0x200, vec![0; 8], 1000 + i * 300))
            .unwrap()
            .is_empty());
    }
    let found = detector.observe(&decoded(0x200, vec![0; 2], 3000)).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].kind, AnomalyKind::DlcChange);
    assert!(found[0].detail.contains("8 -> 2"));
}

#[test]
fn dlc_change_needs_established_baseline() {
    let detector = detector();
    detector.observe(&decoded(0x200, vec![0; 8], 1000)).unwrap();
    // Baseline only has one sample: a change is re-learning, not an
    // anomaly.
    let found = detector.observe(&decoded(0x200, vec![0; 4], 1200)).unwrap();
    assert!(found.is_empty());
}

#[test]
fn refuses_while_emergency_active() {
    let flag = EmergencyFlag::new();
    let detector = AnomalyDetector::new(AnomalyConfig::default(), flag.clone());
    flag.set("halt");
    let err = detector.observe(&decoded(0x100, vec![0], 1000)).unwrap_err();
    assert_eq!(err.kind, crate::error::CanErrorKind::EmergencyStopActive);
}

#[tokio::test]
async fn emergency_stop_disables_scanning() {
    let detector = detector();
    let outcome = detector.emergency_stop("cascade").await;
    assert_eq!(outcome, EmergencyOutcome::SafeMode);
    assert!(detector.observe(&decoded(0x100, vec![0], 1000)).unwrap().is_empty());
}
