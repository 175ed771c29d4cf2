// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios over the fully wired platform.

use std::sync::Arc;
use std::time::Duration;

use canlink::codec::{split_id, BROADCAST_ADDRESS};
use canlink::safety::{
    EmergencyAction, EmergencyOutcome, SafetyAware, SafetyClassification, SafetyStatus,
};
use canlink::spec::dgn;

use coachd::config::PinClass;
use coachd::entity::control::{ControlAction, ControlRequest, MotionCommand, CONTROL_SCOPE};
use coachd::entity::EntityState;
use coachd::error::ErrorKind;
use coachd::events::DomainEvent;
use coachd::registry::ServiceState;
use coachd::repository::audit::AuditKind;
use coachd::security::{AuthContext, ThreatSeverity};
use coachd::test_support::{started_platform, TEST_OVERRIDE_PIN};

use coachlink_specs::{inject_and_settle, verifier_for, wait_for_event};

fn operator() -> AuthContext {
    AuthContext::new("operator", [CONTROL_SCOPE.to_owned()])
}

fn light_request(brightness: f64) -> ControlRequest {
    ControlRequest {
        entity_id: "light.galley".to_owned(),
        action: ControlAction::Light { on: true, brightness: Some(brightness) },
    }
}

// Scenario A: a light control command round-trips through encode,
// transmit, bus confirmation, and reconciliation.
#[tokio::test]
async fn light_control_round_trip() {
    let mut t = started_platform().await;
    let mut events = t.platform.events.subscribe();
    let mut updates = t.platform.events.subscribe();

    let command = t.platform.control.control(&operator(), light_request(80.0)).unwrap();

    // One DC_DIMMER_COMMAND_2 frame on the wire.
    let frame = tokio::time::timeout(
        Duration::from_secs(2),
        t.handles.get_mut("can0").unwrap().sent.recv(),
    )
    .await
    .unwrap()
    .unwrap();
    let header = split_id(frame.can_id);
    assert_eq!(header.pgn, dgn::DC_DIMMER_COMMAND_2);
    assert_eq!(header.priority, 6);
    assert_eq!(header.source, 0xFE);
    assert_eq!(frame.data[0], 4, "instance from the coach mapping");
    assert_eq!(frame.data[2], 200, "80% at the 0.4%/bit dimmer scale");

    // The device answers with a matching status.
    let status = t
        .platform
        .codec
        .encode_raw(
            "can0",
            dgn::DC_DIMMER_STATUS,
            &[("instance", 4), ("brightness", 200)],
            None,
            0x80,
            BROADCAST_ADDRESS,
        )
        .unwrap();
    inject_and_settle(&t, "can0", status).await;

    let confirmed = wait_for_event(&mut events, |e| {
        matches!(e, DomainEvent::CommandConfirmed { command_id, .. } if *command_id == command.id)
    })
    .await;
    assert!(confirmed.is_some(), "command reconciled within the deadline");

    let light = t.platform.entities.get("light.galley").unwrap();
    assert_eq!(light.state, EntityState::Light { on: true, brightness: 80.0 });

    // Exactly one confirmed broadcast carries the new state; the
    // earlier optimistic broadcast is tagged unconfirmed.
    let mut confirmed_updates = 0;
    let mut optimistic_updates = 0;
    while let Ok(event) = updates.try_recv() {
        if let DomainEvent::EntityUpdated { entity_id, confirmed, .. } = event {
            if entity_id == "light.galley" {
                if confirmed {
                    confirmed_updates += 1;
                } else {
                    optimistic_updates += 1;
                }
            }
        }
    }
    assert_eq!(confirmed_updates, 1);
    assert_eq!(optimistic_updates, 1);
}

// Scenario B: a slide extend while the coach is moving is refused by
// the interlock, emits nothing, and is audited with the reason.
#[tokio::test]
async fn interlock_blocks_slide_extend() {
    let mut t = started_platform().await;

    // Chassis reports 5 km/h (raw 1280 at 1/256 km/h per bit).
    let chassis = t
        .platform
        .codec
        .encode_raw(
            "can0",
            dgn::CHASSIS_MOBILITY_STATUS,
            &[("speed", 1280), ("parking_brake", 1), ("leveling_jacks", 0), ("ignition", 1)],
            None,
            0x30,
            BROADCAST_ADDRESS,
        )
        .unwrap();
    inject_and_settle(&t, "can0", chassis).await;
    assert_eq!(t.platform.interlocks.chassis().speed_kmh, 5.0);

    let err = t
        .platform
        .control
        .control(
            &operator(),
            ControlRequest {
                entity_id: "slide.bedroom".to_owned(),
                action: ControlAction::Slide { command: MotionCommand::Extend },
            },
        )
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InterlockViolated);
    assert_eq!(err.message, "vehicle_in_motion");

    // No frame was emitted.
    assert!(t.handles.get_mut("can0").unwrap().sent.try_recv().is_err());

    let blocked = t.platform.audit.by_kind(AuditKind::EntityControlBlocked);
    assert_eq!(blocked.len(), 1);
    assert!(blocked[0].detail.to_string().contains("vehicle_in_motion"));
}

struct FakeActuator {
    name: String,
    action: EmergencyAction,
    reasons: std::sync::Mutex<Vec<String>>,
}

impl FakeActuator {
    fn new(name: &str, action: EmergencyAction) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            action,
            reasons: std::sync::Mutex::new(Vec::new()),
        })
    }

    fn reasons(&self) -> Vec<String> {
        self.reasons.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl SafetyAware for FakeActuator {
    fn name(&self) -> &str {
        &self.name
    }

    fn classification(&self) -> SafetyClassification {
        SafetyClassification::SafetyRelated
    }

    fn emergency_action(&self) -> EmergencyAction {
        self.action
    }

    fn safety_status(&self) -> SafetyStatus {
        SafetyStatus {
            service: self.name.clone(),
            classification: SafetyClassification::SafetyRelated,
            running: true,
            emergency_active: false,
            reason: None,
        }
    }

    fn emergency_stop(&self, reason: &str) -> futures_util::future::BoxFuture<'_, EmergencyOutcome> {
        if let Ok(mut reasons) = self.reasons.lock() {
            reasons.push(reason.to_owned());
        }
        Box::pin(async move { self.action.outcome() })
    }
}

// Scenario C: a CRITICAL service failure cascades into a system-wide
// emergency stop within a second.
#[tokio::test]
async fn emergency_stop_cascade() {
    let t = started_platform().await;

    let stoppers: Vec<Arc<FakeActuator>> = ["lift", "levelers", "steps"]
        .iter()
        .map(|name| FakeActuator::new(name, EmergencyAction::StopImmediately))
        .collect();
    let holder = FakeActuator::new("slide_motor", EmergencyAction::MaintainPosition);
    for actuator in &stoppers {
        t.platform.safety.register_target(Arc::clone(actuator) as Arc<dyn SafetyAware>);
    }
    t.platform.safety.register_target(Arc::clone(&holder) as Arc<dyn SafetyAware>);

    // Simulated CRITICAL failure observed by the supervisor.
    let started = std::time::Instant::now();
    t.platform.registry.set_state("message_injector", ServiceState::Failed);

    // The global flag must rise within a second.
    while !t.platform.safety.is_emergency_active() {
        assert!(started.elapsed() < Duration::from_secs(1), "flag not set within 1 s");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // Give the cascade a moment to finish invoking handlers.
    tokio::time::sleep(Duration::from_millis(100)).await;

    for actuator in &stoppers {
        let reasons = actuator.reasons();
        assert_eq!(reasons.len(), 1, "{} stopped once", actuator.name);
        assert!(reasons[0].contains("message_injector"));
    }
    assert_eq!(holder.reasons().len(), 1);

    // New control requests hard-fail while the flag is up.
    let err = t.platform.control.control(&operator(), light_request(10.0)).unwrap_err();
    assert_eq!(err.kind, ErrorKind::EmergencyStopActive);

    let initiated = t.platform.audit.by_kind(AuditKind::EmergencyStopInitiated);
    assert_eq!(initiated.len(), 1);
    let completed = t.platform.audit.by_kind(AuditKind::EmergencyStopCompleted);
    assert_eq!(completed.len(), 1);
    let detail = completed[0].detail.to_string();
    for actuator in &stoppers {
        assert!(detail.contains(&actuator.name));
    }
    assert!(detail.contains("slide_motor"));
    assert!(detail.contains("maintained"));

    // Operator reset restores service but keeps the trail.
    let pin = t
        .platform
        .pins
        .validate("operator", PinClass::Override, TEST_OVERRIDE_PIN)
        .unwrap();
    t.platform.safety.reset_emergency("operator", &pin.id, true).unwrap();
    assert!(!t.platform.safety.is_emergency_active());
    assert_eq!(t.platform.audit.by_kind(AuditKind::EmergencyStopInitiated).len(), 1);
}

// Scenario D: replaying a recording at double speed preserves order,
// halves the duration, and remaps the capture interface.
#[tokio::test(start_paused = true)]
async fn recorder_replay_with_interface_remap() {
    use canlink::recorder::{
        CanRecorder, RecordedFrame, Recording, ReplayOptions,
    };
    use canlink::safety::EmergencyFlag;

    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(CanRecorder::new(
        dir.path(),
        4096,
        Duration::from_secs(60),
        EmergencyFlag::new(),
    ));

    // 1500 frames over 60 s of capture on can0 (40 ms spacing).
    let frames: Vec<RecordedFrame> = (0..1500u64)
        .map(|i| RecordedFrame {
            timestamp_ms: 1_000 + i * 40,
            interface: "can0".to_owned(),
            can_id: 0x18FEE800,
            extended: true,
            data: vec![(i & 0xFF) as u8],
        })
        .collect();

    let (tx, mut rx) = tokio::sync::mpsc::channel(2048);
    let options = ReplayOptions {
        speed_factor: 2.0,
        interface_map: [("can0".to_owned(), "can1".to_owned())].into_iter().collect(),
        override_filters: false,
    };
    let started = tokio::time::Instant::now();
    recorder
        .start_replay(Recording { session: None, frames }, options, None, tx)
        .unwrap();

    let mut received = Vec::with_capacity(1500);
    for _ in 0..1500 {
        received.push(rx.recv().await.unwrap());
    }
    let elapsed = started.elapsed();

    // All 1500 frames on can1 (none on can0), original order.
    assert_eq!(received.len(), 1500);
    assert!(received.iter().all(|f| f.interface == "can1"));
    let payloads: Vec<u8> = received.iter().map(|f| f.data[0]).collect();
    let expected: Vec<u8> = (0..1500u64).map(|i| (i & 0xFF) as u8).collect();
    assert_eq!(payloads, expected);

    // 59.96 s of spacing at speed 2.0: within 50 ms of 30 s.
    let total_ms = elapsed.as_millis() as i64;
    assert!((total_ms - 29_980).abs() <= 50, "replay took {total_ms} ms");
}

// Scenario E: repeated observations latch an id's protocol; the map of
// detected protocols records the decision.
#[tokio::test]
async fn protocol_auto_classification_latches() {
    let t = started_platform().await;
    let id = 0x18FEF100;

    for i in 0..6u32 {
        let frame =
            canlink::frame::CanFrame::new("can0", id, vec![i as u8, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        inject_and_settle(&t, "can0", frame).await;
        let latched = t.platform.facade.analyzer().is_latched(id);
        if i < 4 {
            assert!(!latched, "latched too early after {} frames", i + 1);
        }
    }

    let analyzer = t.platform.facade.analyzer();
    assert!(analyzer.is_latched(id));
    let detected = analyzer.detected_protocols();
    assert_eq!(detected.get(&id), Some(&canlink::frame::CanProtocol::J1939));
}

// Scenario F: repeated failed logins lock the account, publish a
// high-severity threat, and later attempts skip credential checks.
#[tokio::test]
async fn brute_force_triggers_lockout() {
    let t = started_platform().await;
    let sessions = t.platform.session_service(verifier_for("operator", "hunter2"));
    let mut events = t.platform.events.subscribe();

    for _ in 0..6 {
        let err = sessions.login("operator", "wrong", "10.1.1.1", "probe").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Forbidden);
    }

    let threat = wait_for_event(&mut events, |e| {
        matches!(
            e,
            DomainEvent::SecurityThreat { pattern, .. } if pattern == "excessive_failed_logins"
        )
    })
    .await;
    match threat {
        Some(DomainEvent::SecurityThreat { severity, .. }) => {
            assert!(severity >= ThreatSeverity::High)
        }
        other => panic!("expected a security threat, got {other:?}"),
    }

    // Even the right password no longer reaches the verifier.
    let err = sessions.login("operator", "hunter2", "10.1.1.1", "probe").unwrap_err();
    assert!(err.message.contains("locked"));

    // The security attempts are all in the audit trail.
    let attempts = t.platform.audit.by_kind(AuditKind::SecurityAttempt);
    assert!(attempts.len() >= 7);
}
