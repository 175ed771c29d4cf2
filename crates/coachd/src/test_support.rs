// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared fixtures for unit and integration tests.
//!
//! Builds a full platform on loopback transports with a small coach
//! mapping (galley light, bedroom slide, fresh tank) and a parked
//! chassis, so tests can drive the real pipeline end to end.

#![allow(clippy::panic)]

use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use canlink::spec::dgn;
use canlink::transport::{loopback, LoopbackHandle};

use crate::config::{
    CoachConfig, DaemonConfig, EntityDefinition, EntityKind, PinClass, PinDefinition,
};
use crate::run::Platform;
use crate::safety::interlock::ChassisState;

/// Override PIN provisioned in the test config.
pub const TEST_OVERRIDE_PIN: &str = "4711";

/// A fully wired platform on loopback transports.
pub struct TestPlatform {
    pub platform: Arc<Platform>,
    pub handles: HashMap<String, LoopbackHandle>,
    pub cancel: CancellationToken,
    pub recordings: tempfile::TempDir,
}

impl Drop for TestPlatform {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

/// The standard test coach mapping.
pub fn coach_config() -> CoachConfig {
    CoachConfig {
        interfaces: vec!["can0".to_owned()],
        coach_mapping: vec![
            EntityDefinition {
                id: "light.galley".to_owned(),
                kind: EntityKind::Light,
                instance: 4,
                status_dgn: dgn::DC_DIMMER_STATUS,
                command_dgn: Some(dgn::DC_DIMMER_COMMAND_2),
                interface: "can0".to_owned(),
                name: Some("Galley light".to_owned()),
                icon: None,
                unit: None,
                category: Some("interior".to_owned()),
            },
            EntityDefinition {
                id: "slide.bedroom".to_owned(),
                kind: EntityKind::Slide,
                instance: 1,
                status_dgn: dgn::SLIDE_STATUS,
                command_dgn: Some(dgn::SLIDE_COMMAND),
                interface: "can0".to_owned(),
                name: Some("Bedroom slide".to_owned()),
                icon: None,
                unit: None,
                category: Some("exterior".to_owned()),
            },
            EntityDefinition {
                id: "tank.fresh".to_owned(),
                kind: EntityKind::Tank,
                instance: 0,
                status_dgn: dgn::TANK_STATUS,
                command_dgn: None,
                interface: "can0".to_owned(),
                name: Some("Fresh water".to_owned()),
                icon: None,
                unit: Some("%".to_owned()),
                category: Some("levels".to_owned()),
            },
        ],
        pins: vec![PinDefinition {
            class: PinClass::Override,
            digest: sha256_hex(TEST_OVERRIDE_PIN),
        }],
        ..CoachConfig::default()
    }
}

fn daemon_config(recordings: &std::path::Path) -> DaemonConfig {
    DaemonConfig {
        config: "unused.json".into(),
        recordings_dir: recordings.to_path_buf(),
        health_check_ms: 5000,
        watchdog_ms: 15000,
        reconcile_ms: 2000,
        debounce_ms: 100,
        autosave_ms: 60000,
        transmit_capacity: 1024,
        recorder_capacity: 4096,
        injector_safety: "strict".to_owned(),
        startup_timeout_ms: 2000,
        shutdown_timeout_ms: 2000,
    }
}

/// Build and start a platform over a loopback `can0`, with a parked
/// chassis so movement interlocks hold.
pub async fn started_platform() -> TestPlatform {
    started_platform_with(coach_config()).await
}

/// Same, with a caller-provided coach config.
pub async fn started_platform_with(coach: CoachConfig) -> TestPlatform {
    let recordings = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(e) => panic!("tempdir: {e}"),
    };
    let daemon = daemon_config(recordings.path());

    let mut handles = HashMap::new();
    let mut transports: Vec<Box<dyn canlink::transport::BusTransport>> = Vec::new();
    for interface in &coach.interfaces {
        let (transport, handle) = loopback(interface.clone(), 1024);
        handles.insert(interface.clone(), handle);
        transports.push(Box::new(transport));
    }

    let platform = match Platform::build(&daemon, coach, transports) {
        Ok(platform) => platform,
        Err(e) => panic!("platform build: {e}"),
    };
    platform.interlocks.set_chassis(ChassisState {
        speed_kmh: 0.0,
        parking_brake_engaged: true,
        jacks_deployed: false,
        ignition_on: false,
        updated_ms: 1,
    });

    let cancel = CancellationToken::new();
    if let Err(e) = platform.start(cancel.clone()).await {
        panic!("platform start: {e}");
    }
    TestPlatform { platform, handles, cancel, recordings }
}
