// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

fn recorder(dir: &Path) -> Arc<CanRecorder> {
    Arc::new(CanRecorder::new(dir, 4096, Duration::from_secs(60), EmergencyFlag::new()))
}

fn frame(interface: &str, can_id: u32, ts: u64) -> CanFrame {
    let mut frame = CanFrame::new(interface, can_id, vec![0x11, 0x22]).unwrap();
    frame.timestamp_ms = ts;
    frame
}

fn sample_frames() -> Vec<RecordedFrame> {
    vec![
        RecordedFrame {
            timestamp_ms: 1000,
            interface: "can0".to_owned(),
            can_id: 0x18FEE800,
            extended: true,
            data: vec![0x10, 0x27, 0xFF],
        },
        RecordedFrame {
            timestamp_ms: 1040,
            interface: "can0".to_owned(),
            can_id: 0x123,
            extended: false,
            data: vec![],
        },
    ]
}

#[test]
fn lifecycle_start_record_stop() {
    let dir = tempfile::tempdir().unwrap();
    let rec = recorder(dir.path());

    let session = rec
        .start_recording("trip", RecordingFormat::Jsonl, vec![], RecorderFilters::default())
        .unwrap();
    assert_eq!(rec.mode(), RecorderMode::Recording);

    assert!(rec.record(&frame("can0", 0x100, 1000)));
    assert!(rec.record(&frame("can0", 0x101, 1010)));

    let stopped = rec.stop_recording().unwrap();
    assert_eq!(stopped.id, session.id);
    assert_eq!(stopped.frame_count, 2);
    assert!(stopped.stopped_ms.is_some());
    assert_eq!(rec.mode(), RecorderMode::Idle);

    let files = rec.list();
    assert_eq!(files.len(), 1);
    let loaded = rec.load(&files[0]).unwrap();
    assert_eq!(loaded.frames.len(), 2);
    assert_eq!(loaded.session.unwrap().name, "trip");
}

#[test]
fn double_start_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let rec = recorder(dir.path());
    rec.start_recording("a", RecordingFormat::Jsonl, vec![], RecorderFilters::default()).unwrap();
    let err = rec
        .start_recording("b", RecordingFormat::Jsonl, vec![], RecorderFilters::default())
        .unwrap_err();
    assert_eq!(err.kind, crate::error::CanErrorKind::Conflict);
}

#[test]
fn pause_suspends_capture() {
    let dir = tempfile::tempdir().unwrap();
    let rec = recorder(dir.path());
    rec.start_recording("p", RecordingFormat::Jsonl, vec![], RecorderFilters::default()).unwrap();
    assert!(rec.record(&frame("can0", 0x100, 1000)));
    rec.pause().unwrap();
    assert!(!rec.record(&frame("can0", 0x101, 1010)));
    rec.resume().unwrap();
    assert!(rec.record(&frame("can0", 0x102, 1020)));
}

#[test]
fn interface_and_id_filters_apply() {
    let dir = tempfile::tempdir().unwrap();
    let rec = recorder(dir.path());
    let filters = RecorderFilters {
        can_ids: Some([0x100u32].into_iter().collect()),
        interfaces: None,
    };
    rec.start_recording("f", RecordingFormat::Jsonl, vec!["can0".to_owned()], filters).unwrap();

    assert!(rec.record(&frame("can0", 0x100, 1000)));
    assert!(!rec.record(&frame("can1", 0x100, 1001)), "wrong interface");
    assert!(!rec.record(&frame("can0", 0x200, 1002)), "filtered id");
}

#[parameterized(
    jsonl = { RecordingFormat::Jsonl },
    csv = { RecordingFormat::Csv },
    binary = { RecordingFormat::Binary },
    candump = { RecordingFormat::Candump },
)]
fn format_round_trip(format: RecordingFormat) {
    let dir = tempfile::tempdir().unwrap();
    let rec = recorder(dir.path());
    rec.start_recording("rt", format, vec![], RecorderFilters::default()).unwrap();
    for f in sample_frames() {
        let mut raw = f.to_frame(None);
        raw.timestamp_ms = f.timestamp_ms;
        assert!(rec.record(&raw));
    }
    rec.stop_recording().unwrap();

    let files = rec.list();
    assert_eq!(files.len(), 1);
    let loaded = rec.load(&files[0]).unwrap();
    assert_eq!(loaded.frames.len(), 2);
    assert_eq!(loaded.frames[0].can_id, 0x18FEE800);
    assert_eq!(loaded.frames[0].data, vec![0x10, 0x27, 0xFF]);
    assert!(loaded.frames[0].extended);
    assert_eq!(loaded.frames[1].can_id, 0x123);
    assert!(!loaded.frames[1].extended);
}

#[test]
fn ring_overflow_is_observable() {
    let dir = tempfile::tempdir().unwrap();
    let rec = Arc::new(CanRecorder::new(dir.path(), 2, Duration::from_secs(60), EmergencyFlag::new()));
    rec.start_recording("o", RecordingFormat::Jsonl, vec![], RecorderFilters::default()).unwrap();
    for i in 0..5u32 {
        rec.record(&frame("can0", 0x100 + i, 1000 + i as u64));
    }
    assert_eq!(rec.overflow(), 3);
    let session = rec.stop_recording().unwrap();
    assert_eq!(session.frame_count, 5);
}

#[tokio::test(start_paused = true)]
async fn replay_preserves_order_and_scales_timing() {
    let dir = tempfile::tempdir().unwrap();
    let rec = recorder(dir.path());

    // 11 frames spaced 100 ms apart: 1 s of traffic.
    let frames: Vec<RecordedFrame> = (0..11u64)
        .map(|i| RecordedFrame {
            timestamp_ms: 1000 + i * 100,
            interface: "can0".to_owned(),
            can_id: 0x100 + i as u32,
            extended: false,
            data: vec![i as u8],
        })
        .collect();
    let recording = Recording { session: None, frames };

    let (tx, mut rx) = mpsc::channel(64);
    let options = ReplayOptions {
        speed_factor: 2.0,
        interface_map: [("can0".to_owned(), "can1".to_owned())].into_iter().collect(),
        override_filters: false,
    };
    let started = tokio::time::Instant::now();
    rec.start_replay(recording, options, None, tx).unwrap();

    let mut emitted = Vec::new();
    for _ in 0..11 {
        emitted.push(rx.recv().await.unwrap());
    }
    let elapsed = started.elapsed();

    // All frames remapped onto can1, in original order.
    assert!(emitted.iter().all(|f| f.interface == "can1"));
    let ids: Vec<u32> = emitted.iter().map(|f| f.can_id).collect();
    assert_eq!(ids, (0..11u32).map(|i| 0x100 + i).collect::<Vec<_>>());

    // 1 s of spacing at speed 2.0 is 500 ms of virtual time.
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed < Duration::from_millis(600));
}

#[tokio::test]
async fn replay_honors_capture_filters() {
    let dir = tempfile::tempdir().unwrap();
    let rec = recorder(dir.path());

    let session = RecordingSession {
        id: "s".to_owned(),
        name: "s".to_owned(),
        format: RecordingFormat::Jsonl,
        interfaces: vec![],
        filters: RecorderFilters {
            can_ids: Some([0x100u32].into_iter().collect()),
            interfaces: None,
        },
        started_ms: 0,
        stopped_ms: None,
        frame_count: 2,
    };
    let frames = vec![
        RecordedFrame { timestamp_ms: 0, interface: "can0".into(), can_id: 0x100, extended: false, data: vec![] },
        RecordedFrame { timestamp_ms: 1, interface: "can0".into(), can_id: 0x200, extended: false, data: vec![] },
    ];

    let (tx, mut rx) = mpsc::channel(8);
    rec.start_replay(
        Recording { session: Some(session), frames },
        ReplayOptions::default(),
        None,
        tx,
    )
    .unwrap();

    assert_eq!(rx.recv().await.unwrap().can_id, 0x100);
    // The 0x200 frame was skipped and the channel closed after the task
    // finished.
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn replay_modifier_transforms_frames() {
    let dir = tempfile::tempdir().unwrap();
    let rec = recorder(dir.path());
    let frames = vec![RecordedFrame {
        timestamp_ms: 0,
        interface: "can0".into(),
        can_id: 0x100,
        extended: false,
        data: vec![0x01],
    }];
    let (tx, mut rx) = mpsc::channel(8);
    let modifier: FrameModifier = Arc::new(|frame: &mut CanFrame| frame.data = vec![0xEE]);
    rec.start_replay(
        Recording { session: None, frames },
        ReplayOptions::default(),
        Some(modifier),
        tx,
    )
    .unwrap();
    assert_eq!(rx.recv().await.unwrap().data, vec![0xEE]);
}

#[tokio::test]
async fn emergency_stop_flushes_and_refuses() {
    let dir = tempfile::tempdir().unwrap();
    let flag = EmergencyFlag::new();
    let rec = Arc::new(CanRecorder::new(dir.path(), 64, Duration::from_secs(60), flag.clone()));
    rec.start_recording("e", RecordingFormat::Jsonl, vec![], RecorderFilters::default()).unwrap();
    rec.record(&frame("can0", 0x100, 1000));

    let outcome = rec.emergency_stop("cascade").await;
    assert_eq!(outcome, EmergencyOutcome::SafeMode);
    assert_eq!(rec.mode(), RecorderMode::Idle);
    assert_eq!(rec.list().len(), 1, "session flushed to disk");

    flag.set("still active");
    let err = rec
        .start_recording("n", RecordingFormat::Jsonl, vec![], RecorderFilters::default())
        .unwrap_err();
    assert_eq!(err.kind, crate::error::CanErrorKind::EmergencyStopActive);
}
