// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Passive anomaly scan of bus traffic.
//!
//! Watches the decoded stream for patterns that are suspicious rather
//! than merely interesting: per-id message floods, source addresses
//! appearing after the learning window closed, and DLC changes on ids
//! with an established payload length. Detections publish once and
//! suppress until the condition clears; the detector never touches the
//! frames themselves.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::CanResult;
use crate::frame::DecodedFrame;
use crate::safety::{
    EmergencyAction, EmergencyFlag, EmergencyOutcome, SafetyAware, SafetyClassification,
    SafetyStatus,
};

/// Detector tuning knobs.
#[derive(Debug, Clone)]
pub struct AnomalyConfig {
    /// Frames per id per second before the id is flagged as flooding.
    pub flood_threshold_per_sec: u32,
    /// Rate window for flood accounting.
    pub rate_window_ms: u64,
    /// Sources observed during this initial window become the known
    /// baseline; later arrivals are flagged.
    pub learning_window_ms: u64,
    /// Observations of one id with a stable DLC before a change is
    /// flagged.
    pub dlc_min_samples: u32,
    /// Anomaly event channel capacity.
    pub channel_capacity: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            flood_threshold_per_sec: 500,
            rate_window_ms: 1_000,
            learning_window_ms: 30_000,
            dlc_min_samples: 10,
            channel_capacity: 256,
        }
    }
}

/// What was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    MessageFlood,
    NewSourceAddress,
    DlcChange,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageFlood => "message_flood",
            Self::NewSourceAddress => "new_source_address",
            Self::DlcChange => "dlc_change",
        }
    }
}

/// Detector-local severity; the platform maps this into its threat
/// tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    Info,
    Warning,
    Critical,
}

impl AnomalySeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// A single detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub severity: AnomalySeverity,
    pub interface: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<u8>,
    pub detail: String,
    pub timestamp_ms: u64,
}

#[derive(Default)]
struct DetectorState {
    first_seen_ms: Option<u64>,
    rate: HashMap<u32, VecDeque<u64>>,
    flooding: HashSet<u32>,
    known_sources: HashSet<u8>,
    dlc_baseline: HashMap<u32, (usize, u32)>,
}

/// Aggregate counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyStats {
    pub observed_frames: u64,
    pub anomalies: u64,
    pub known_sources: usize,
}

/// Passive scanner over the decoded stream.
pub struct AnomalyDetector {
    config: AnomalyConfig,
    emergency: EmergencyFlag,
    running: AtomicBool,
    state: Mutex<DetectorState>,
    observed: AtomicU64,
    detected: AtomicU64,
    tx: broadcast::Sender<Anomaly>,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig, emergency: EmergencyFlag) -> Self {
        let (tx, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            config,
            emergency,
            running: AtomicBool::new(true),
            state: Mutex::new(DetectorState::default()),
            observed: AtomicU64::new(0),
            detected: AtomicU64::new(0),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Anomaly> {
        self.tx.subscribe()
    }

    /// Scan one decoded frame. Returns the detections it produced.
    pub fn observe(&self, frame: &DecodedFrame) -> CanResult<Vec<Anomaly>> {
        self.emergency.guard("anomaly_scan")?;
        if !self.running.load(Ordering::Acquire) {
            return Ok(Vec::new());
        }
        self.observed.fetch_add(1, Ordering::Relaxed);

        let now = frame.frame.timestamp_ms;
        let id = frame.frame.can_id;
        let mut state = self.state.lock();
        let first_seen = *state.first_seen_ms.get_or_insert(now);
        let mut found = Vec::new();

        // Flood: frames per id inside the rate window.
        let window = self.config.rate_window_ms;
        let rate = state.rate.entry(id).or_default();
        rate.push_back(now);
        while rate.front().is_some_and(|&t| now.saturating_sub(t) > window) {
            rate.pop_front();
        }
        let per_window = rate.len() as u64;
        let threshold =
            self.config.flood_threshold_per_sec as u64 * window.max(1) / 1_000;
        if per_window > threshold {
            if state.flooding.insert(id) {
                found.push(Anomaly {
                    kind: AnomalyKind::MessageFlood,
                    severity: AnomalySeverity::Critical,
                    interface: frame.frame.interface.clone(),
                    can_id: Some(id),
                    source: frame.source,
                    detail: format!("{per_window} frames in {window} ms"),
                    timestamp_ms: now,
                });
            }
        } else {
            state.flooding.remove(&id);
        }

        // Source census: after the learning window, unseen addresses are
        // worth a look.
        if let Some(source) = frame.source {
            let is_new = state.known_sources.insert(source);
            if is_new && now.saturating_sub(first_seen) > self.config.learning_window_ms {
                found.push(Anomaly {
                    kind: AnomalyKind::NewSourceAddress,
                    severity: AnomalySeverity::Warning,
                    interface: frame.frame.interface.clone(),
                    can_id: Some(id),
                    source: Some(source),
                    detail: format!("source {source:#04x} first seen after learning window"),
                    timestamp_ms: now,
                });
            }
        }

        // DLC change on an id with an established payload length.
        let dlc = frame.frame.data.len();
        match state.dlc_baseline.get_mut(&id) {
            Some((baseline, samples)) if *baseline == dlc => {
                *samples = samples.saturating_add(1);
            }
            Some((baseline, samples)) => {
                if *samples >= self.config.dlc_min_samples {
                    found.push(Anomaly {
                        kind: AnomalyKind::DlcChange,
                        severity: AnomalySeverity::Warning,
                        interface: frame.frame.interface.clone(),
                        can_id: Some(id),
                        source: frame.source,
                        detail: format!("payload length changed {baseline} -> {dlc}"),
                        timestamp_ms: now,
                    });
                }
                *baseline = dlc;
                *samples = 1;
            }
            None => {
                state.dlc_baseline.insert(id, (dlc, 1));
            }
        }
        drop(state);

        self.detected.fetch_add(found.len() as u64, Ordering::Relaxed);
        for anomaly in &found {
            tracing::warn!(
                kind = anomaly.kind.as_str(),
                severity = anomaly.severity.as_str(),
                can_id = anomaly.can_id.map(|id| format!("{id:#x}")).unwrap_or_default(),
                "bus anomaly detected"
            );
            let _ = self.tx.send(anomaly.clone());
        }
        Ok(found)
    }

    pub fn statistics(&self) -> AnomalyStats {
        AnomalyStats {
            observed_frames: self.observed.load(Ordering::Relaxed),
            anomalies: self.detected.load(Ordering::Relaxed),
            known_sources: self.state.lock().known_sources.len(),
        }
    }
}

impl SafetyAware for AnomalyDetector {
    fn name(&self) -> &str {
        "anomaly_detector"
    }

    fn classification(&self) -> SafetyClassification {
        SafetyClassification::Operational
    }

    fn emergency_action(&self) -> EmergencyAction {
        EmergencyAction::EnterSafeMode
    }

    fn safety_status(&self) -> SafetyStatus {
        SafetyStatus {
            service: "anomaly_detector".to_owned(),
            classification: SafetyClassification::Operational,
            running: self.running.load(Ordering::Acquire),
            emergency_active: self.emergency.is_active(),
            reason: self.emergency.reason(),
        }
    }

    fn emergency_stop(&self, reason: &str) -> futures_util::future::BoxFuture<'_, EmergencyOutcome> {
        self.running.store(false, Ordering::Release);
        tracing::warn!(reason, "anomaly detector entering safe mode");
        Box::pin(async move { self.emergency_action().outcome() })
    }
}

#[cfg(test)]
#[path = "anomaly_tests.rs"]
mod tests;
