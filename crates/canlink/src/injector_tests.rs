// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use std::sync::Arc;

struct Harness {
    injector: Arc<MessageInjector>,
    transmit_rx: mpsc::Receiver<CanFrame>,
    audit_rx: mpsc::Receiver<InjectionAudit>,
    emergency: EmergencyFlag,
}

fn harness(level: SafetyLevel) -> Harness {
    let (transmit_tx, transmit_rx) = mpsc::channel(64);
    let (audit_tx, audit_rx) = mpsc::channel(64);
    let emergency = EmergencyFlag::new();
    let injector = Arc::new(MessageInjector::new(
        level,
        default_dangerous_pgns(),
        transmit_tx,
        audit_tx,
        emergency.clone(),
    ));
    Harness { injector, transmit_rx, audit_rx, emergency }
}

fn single(can_id: u32) -> InjectionRequest {
    InjectionRequest {
        interface: "can0".to_owned(),
        can_id,
        data: vec![0x01, 0x02],
        mode: InjectionMode::Single,
        principal: "tester".to_owned(),
        reason: "unit test".to_owned(),
    }
}

#[tokio::test]
async fn single_injection_transmits_and_audits() {
    let mut h = harness(SafetyLevel::Strict);
    let outcome = h.injector.inject(single(0x18FEE800)).await.unwrap();
    assert_eq!(outcome.injected, 1);
    assert!(!outcome.background);

    let frame = h.transmit_rx.recv().await.unwrap();
    assert_eq!(frame.can_id, 0x18FEE800);

    let audit = h.audit_rx.recv().await.unwrap();
    assert!(audit.allowed);
    assert_eq!(audit.principal, "tester");
    assert_eq!(audit.reason, "unit test");
}

#[tokio::test]
async fn strict_blocks_dangerous_pgn() {
    let mut h = harness(SafetyLevel::Strict);
    // 0x18FEF2xx: electronic brake controller
    let err = h.injector.inject(single(0x18FEF200)).await.unwrap_err();
    assert_eq!(err.kind, crate::error::CanErrorKind::InterlockViolated);

    let audit = h.audit_rx.recv().await.unwrap();
    assert!(!audit.allowed);

    let stats = h.injector.statistics();
    assert_eq!(stats.blocked, 1);
    assert_eq!(stats.dangerous_blocked, 1);
    assert!(h.transmit_rx.try_recv().is_err());
}

#[tokio::test]
async fn moderate_warns_on_dangerous_pgn() {
    let mut h = harness(SafetyLevel::Moderate);
    let outcome = h.injector.inject(single(0x18FEF200)).await.unwrap();
    assert_eq!(outcome.injected, 1);
    assert_eq!(outcome.warnings.len(), 1);
    assert!(h.transmit_rx.recv().await.is_some());
}

#[tokio::test]
async fn permissive_allows_dangerous_pgn() {
    let h = harness(SafetyLevel::Permissive);
    let outcome = h.injector.inject(single(0x18FEF200)).await.unwrap();
    assert!(outcome.warnings.is_empty());
}

#[tokio::test]
async fn rvc_alias_of_dangerous_pgn_is_caught() {
    let h = harness(SafetyLevel::Strict);
    // Data page 1 alias: pgn 0x1FEF2 masks down to 0xFEF2.
    let err = h.injector.inject(single(0x19FEF200)).await.unwrap_err();
    assert_eq!(err.kind, crate::error::CanErrorKind::InterlockViolated);
}

#[tokio::test]
async fn burst_emits_count_frames() {
    let mut h = harness(SafetyLevel::Strict);
    let mut request = single(0x18FEE800);
    request.mode = InjectionMode::Burst { count: 3, gap_ms: 10 };
    let outcome = h.injector.inject(request).await.unwrap();
    assert_eq!(outcome.injected, 3);
    for _ in 0..3 {
        assert!(h.transmit_rx.recv().await.is_some());
    }
}

#[tokio::test]
async fn burst_gap_floor_enforced() {
    let h = harness(SafetyLevel::Strict);
    let mut request = single(0x18FEE800);
    request.mode = InjectionMode::Burst { count: 5, gap_ms: 1 };
    let err = h.injector.inject(request).await.unwrap_err();
    assert_eq!(err.kind, crate::error::CanErrorKind::InvalidInput);
}

#[tokio::test]
async fn periodic_interval_floor_enforced() {
    let h = harness(SafetyLevel::Strict);
    let mut request = single(0x18FEE800);
    request.mode = InjectionMode::Periodic { interval_ms: 5, count: None };
    let err = h.injector.inject(request).await.unwrap_err();
    assert_eq!(err.kind, crate::error::CanErrorKind::InvalidInput);
}

#[tokio::test(start_paused = true)]
async fn periodic_runs_until_count() {
    let mut h = harness(SafetyLevel::Strict);
    let mut request = single(0x18FEE800);
    request.mode = InjectionMode::Periodic { interval_ms: 50, count: Some(3) };
    let outcome = h.injector.inject(request).await.unwrap();
    assert!(outcome.background);

    for _ in 0..3 {
        assert!(h.transmit_rx.recv().await.is_some());
    }
    // Task finished: no further frames and no active tasks.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    assert!(h.transmit_rx.try_recv().is_err());
    assert_eq!(h.injector.statistics().active_tasks, 0);
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_periodic_task() {
    let h = harness(SafetyLevel::Strict);
    let mut request = single(0x18FEE800);
    request.mode = InjectionMode::Periodic { interval_ms: 100, count: None };
    let outcome = h.injector.inject(request).await.unwrap();

    assert_eq!(h.injector.stop(Some(&outcome.task_id)), 1);
    assert_eq!(h.injector.stop(Some(&outcome.task_id)), 0);
}

#[tokio::test]
async fn sequence_emits_in_order() {
    let mut h = harness(SafetyLevel::Strict);
    let request = InjectionRequest {
        interface: "can0".to_owned(),
        can_id: 0,
        data: vec![],
        mode: InjectionMode::Sequence {
            frames: vec![
                SequenceFrame { can_id: 0x100, data: vec![1] },
                SequenceFrame { can_id: 0x200, data: vec![2] },
            ],
            gap_ms: 10,
        },
        principal: "tester".to_owned(),
        reason: "sequence".to_owned(),
    };
    let outcome = h.injector.inject(request).await.unwrap();
    assert_eq!(outcome.injected, 2);
    assert_eq!(h.transmit_rx.recv().await.unwrap().can_id, 0x100);
    assert_eq!(h.transmit_rx.recv().await.unwrap().can_id, 0x200);
}

#[tokio::test]
async fn emergency_blocks_new_requests() {
    let h = harness(SafetyLevel::Permissive);
    h.emergency.set("cascade");
    let err = h.injector.inject(single(0x18FEE800)).await.unwrap_err();
    assert_eq!(err.kind, crate::error::CanErrorKind::EmergencyStopActive);
}

#[tokio::test]
async fn emergency_stop_reports_stopped() {
    let h = harness(SafetyLevel::Strict);
    let outcome = h.injector.emergency_stop("critical failure").await;
    assert_eq!(outcome, EmergencyOutcome::Stopped);
    let err = h.injector.inject(single(0x18FEE800)).await.unwrap_err();
    assert_eq!(err.kind, crate::error::CanErrorKind::Conflict);
}
