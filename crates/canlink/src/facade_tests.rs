// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::analyzer::AnalyzerConfig;
use crate::anomaly::{AnomalyConfig, AnomalyDetector};
use crate::filter::{FilterAction, FilterCondition, FilterField, FilterOp, FilterRule, FilterValue};
use crate::recorder::{RecorderFilters, RecordingFormat};
use crate::spec::SpecTable;
use crate::transport::{loopback, LoopbackHandle};

struct Harness {
    facade: Arc<CanFacade>,
    handles: HashMap<String, LoopbackHandle>,
    cancel: CancellationToken,
    _dir: tempfile::TempDir,
}

fn harness(interfaces: &[&str]) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let emergency = EmergencyFlag::new();
    let codec = Codec::new(Arc::new(SpecTable::builtin()));
    let analyzer = Arc::new(ProtocolAnalyzer::new(AnalyzerConfig::default(), emergency.clone()));
    let anomaly = Arc::new(AnomalyDetector::new(AnomalyConfig::default(), emergency.clone()));
    let filter = Arc::new(MessageFilter::new(64, 64, emergency.clone()));
    let recorder = Arc::new(CanRecorder::new(
        dir.path(),
        1024,
        Duration::from_secs(60),
        emergency.clone(),
    ));
    let facade = Arc::new(CanFacade::new(
        codec,
        InterfaceMap::new(),
        analyzer,
        anomaly,
        filter,
        recorder,
        emergency,
        16,
        64,
    ));

    let mut handles = HashMap::new();
    for name in interfaces {
        let (transport, handle) = loopback(*name, 64);
        facade.add_transport(Arc::new(transport)).unwrap();
        handles.insert((*name).to_owned(), handle);
    }

    let cancel = CancellationToken::new();
    facade.start(cancel.clone()).unwrap();
    Harness { facade, handles, cancel, _dir: dir }
}

fn frame(interface: &str, can_id: u32) -> CanFrame {
    CanFrame::new(interface, can_id, vec![0xAB, 0xCD]).unwrap()
}

#[tokio::test]
async fn transmit_routes_to_transport() {
    let mut h = harness(&["can0"]);
    h.facade.transmit(frame("can0", 0x18FEE800)).unwrap();
    let sent = h.handles.get_mut("can0").unwrap().sent.recv().await.unwrap();
    assert_eq!(sent.can_id, 0x18FEE800);
    h.cancel.cancel();
}

#[tokio::test]
async fn inbound_frames_broadcast_to_subscribers() {
    let h = harness(&["can0"]);
    let mut rx = h.facade.subscribe_decoded();
    h.handles["can0"].inject.send(frame("can0", 0x18FEE800)).await.unwrap();
    let decoded = rx.recv().await.unwrap();
    assert_eq!(decoded.pgn, Some(0xFEE8));
    assert_eq!(h.facade.statistics().frames_received, 1);
    h.cancel.cancel();
}

#[tokio::test]
async fn blocked_frames_do_not_reach_subscribers() {
    let h = harness(&["can0"]);
    h.facade
        .filter()
        .add_rule(FilterRule {
            id: "blk".to_owned(),
            name: "block fee8".to_owned(),
            description: String::new(),
            priority: 50,
            enabled: true,
            conditions: vec![FilterCondition::new(
                FilterField::Pgn,
                FilterOp::Eq,
                FilterValue::Number(0xFEE8),
            )],
            logic: Default::default(),
            actions: vec![FilterAction::Block],
        })
        .unwrap();

    let mut rx = h.facade.subscribe_decoded();
    h.handles["can0"].inject.send(frame("can0", 0x18FEE800)).await.unwrap();
    h.handles["can0"].inject.send(frame("can0", 0x18FEF100)).await.unwrap();

    // Only the non-blocked frame arrives.
    let decoded = rx.recv().await.unwrap();
    assert_eq!(decoded.pgn, Some(0xFEF1));
    assert_eq!(h.facade.statistics().frames_blocked, 1);
    h.cancel.cancel();
}

#[tokio::test]
async fn recorder_taps_passing_frames() {
    let h = harness(&["can0"]);
    h.facade
        .recorder()
        .start_recording("tap", RecordingFormat::Jsonl, vec![], RecorderFilters::default())
        .unwrap();
    let mut rx = h.facade.subscribe_decoded();
    h.handles["can0"].inject.send(frame("can0", 0x18FEE800)).await.unwrap();
    rx.recv().await.unwrap();

    let session = h.facade.recorder().stop_recording().unwrap();
    assert_eq!(session.frame_count, 1);
    h.cancel.cancel();
}

#[tokio::test]
async fn transmit_queue_full_fails_fast() {
    // No drain consumer: build an unstarted facade with capacity 2.
    let dir = tempfile::tempdir().unwrap();
    let emergency = EmergencyFlag::new();
    let codec = Codec::new(Arc::new(SpecTable::builtin()));
    let analyzer = Arc::new(ProtocolAnalyzer::new(AnalyzerConfig::default(), emergency.clone()));
    let anomaly = Arc::new(AnomalyDetector::new(AnomalyConfig::default(), emergency.clone()));
    let filter = Arc::new(MessageFilter::new(8, 8, emergency.clone()));
    let recorder = Arc::new(CanRecorder::new(
        dir.path(),
        8,
        Duration::from_secs(60),
        emergency.clone(),
    ));
    let facade = CanFacade::new(
        codec,
        InterfaceMap::new(),
        analyzer,
        anomaly,
        filter,
        recorder,
        emergency,
        2,
        8,
    );

    facade.transmit(frame("can0", 1)).unwrap();
    facade.transmit(frame("can0", 2)).unwrap();
    let err = facade.transmit(frame("can0", 3)).unwrap_err();
    assert_eq!(err.kind, crate::error::CanErrorKind::TransmitQueueFull);
}

#[tokio::test]
async fn unknown_interface_frames_dropped_and_counted() {
    let h = harness(&["can0"]);
    h.facade.transmit(frame("can9", 0x100)).unwrap();
    // Drain task processes asynchronously.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.facade.statistics().unknown_interface_drops, 1);
    h.cancel.cancel();
}

#[tokio::test]
async fn emergency_cascade_covers_can_services() {
    let h = harness(&["can0"]);
    let outcomes = h.facade.emergency_stop_all("critical failure").await;
    let names: Vec<&str> = outcomes.iter().map(|(n, _)| n.as_str()).collect();
    assert!(names.contains(&"protocol_analyzer"));
    assert!(names.contains(&"anomaly_detector"));
    assert!(names.contains(&"message_filter"));
    assert!(names.contains(&"can_recorder"));
    assert!(outcomes.iter().all(|(_, o)| *o != EmergencyOutcome::TimedOut));
    h.cancel.cancel();
}

#[tokio::test]
async fn per_interface_order_is_preserved() {
    let h = harness(&["can0"]);
    let mut rx = h.facade.subscribe_decoded();
    for i in 0..20u32 {
        h.handles["can0"].inject.send(frame("can0", 0x500 + i)).await.unwrap();
    }
    let mut seen = Vec::new();
    for _ in 0..20 {
        seen.push(rx.recv().await.unwrap().frame.can_id);
    }
    assert_eq!(seen, (0..20u32).map(|i| 0x500 + i).collect::<Vec<_>>());
    h.cancel.cancel();
}
