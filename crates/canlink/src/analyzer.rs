// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Passive protocol analyzer.
//!
//! Feeds the tentative per-frame classification from the codec into
//! per-id hint counts and latches the detected protocol after enough
//! consistent observations. Tracks per-id interval statistics inside a
//! sliding window and publishes communication patterns (periodic,
//! request/response, broadcast) once per detection.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::codec;
use crate::error::CanResult;
use crate::frame::{CanProtocol, DecodedFrame};
use crate::safety::{
    EmergencyAction, EmergencyFlag, EmergencyOutcome, SafetyAware, SafetyClassification,
    SafetyStatus,
};

/// Analyzer tuning knobs.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Observations of one id with a consistent classification before the
    /// protocol is latched.
    pub latch_threshold: u32,
    /// Sliding window for interval statistics and pattern detection.
    pub pattern_window_ms: u64,
    /// Minimum observations inside the window before an id can be called
    /// periodic.
    pub periodic_min_samples: usize,
    /// Timestamps retained per id.
    pub per_id_history: usize,
    /// Re-detections of a periodic pattern within this interval delta are
    /// suppressed.
    pub periodic_dedup_ms: f64,
    /// Distinct destinations before a source is called a broadcaster.
    pub broadcast_min_destinations: usize,
    /// Pattern event channel capacity.
    pub channel_capacity: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            latch_threshold: 5,
            pattern_window_ms: 5_000,
            periodic_min_samples: 3,
            per_id_history: 64,
            periodic_dedup_ms: 10.0,
            broadcast_min_destinations: 3,
            channel_capacity: 256,
        }
    }
}

/// A detected communication pattern, published once per detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommunicationPattern {
    /// One id transmitting on a stable interval.
    Periodic { can_id: u32, interval_ms: f64, confidence: f64 },
    /// Two nodes exchanging destination-specific frames in both directions.
    RequestResponse { node_a: u8, node_b: u8 },
    /// One source addressing many distinct destinations.
    Broadcast { source: u8, destinations: usize },
}

/// Per-protocol traffic counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMetrics {
    pub message_count: u64,
    pub byte_count: u64,
    pub unique_ids: usize,
}

/// Aggregate analyzer statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerStats {
    pub observed_frames: u64,
    pub latched_ids: usize,
    pub patterns_detected: u64,
    pub per_protocol: HashMap<String, ProtocolMetrics>,
}

#[derive(Default)]
struct AnalyzerState {
    hints: HashMap<u32, (CanProtocol, u32)>,
    latched: HashMap<u32, CanProtocol>,
    timestamps: HashMap<u32, VecDeque<u64>>,
    pair_counts: HashMap<(u8, u8), VecDeque<u64>>,
    destinations: HashMap<u8, HashSet<u8>>,
    emitted_periodic: HashMap<u32, f64>,
    emitted_pairs: HashSet<(u8, u8)>,
    emitted_broadcast: HashMap<u8, usize>,
    metrics: HashMap<CanProtocol, (u64, u64, HashSet<u32>)>,
    observed_frames: u64,
    patterns_detected: u64,
}

/// Passive bus analyzer. All methods are cheap and lock-scoped; the
/// facade calls [`ProtocolAnalyzer::observe`] inline on the inbound path.
pub struct ProtocolAnalyzer {
    config: AnalyzerConfig,
    emergency: EmergencyFlag,
    running: std::sync::atomic::AtomicBool,
    state: Mutex<AnalyzerState>,
    pattern_tx: broadcast::Sender<CommunicationPattern>,
}

impl ProtocolAnalyzer {
    pub fn new(config: AnalyzerConfig, emergency: EmergencyFlag) -> Self {
        let (pattern_tx, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            config,
            emergency,
            running: std::sync::atomic::AtomicBool::new(true),
            state: Mutex::new(AnalyzerState::default()),
            pattern_tx,
        }
    }

    /// Subscribe to pattern detections.
    pub fn subscribe_patterns(&self) -> broadcast::Receiver<CommunicationPattern> {
        self.pattern_tx.subscribe()
    }

    /// Observe one decoded frame.
    ///
    /// Returns the effective protocol for the frame's id: the latched
    /// protocol when established, otherwise the frame's tentative
    /// classification. Refused while emergency stop is active.
    pub fn observe(&self, frame: &DecodedFrame) -> CanResult<CanProtocol> {
        self.emergency.guard("analyze")?;
        if !self.running.load(std::sync::atomic::Ordering::Acquire) {
            return Ok(frame.protocol);
        }

        let mut state = self.state.lock();
        state.observed_frames += 1;

        let id = frame.frame.can_id;
        let now = frame.frame.timestamp_ms;

        // Latched ids skip classification cost entirely.
        let effective = if let Some(latched) = state.latched.get(&id) {
            *latched
        } else {
            let tentative = frame.protocol;
            let (hint, count) = state.hints.entry(id).or_insert((tentative, 0));
            if *hint == tentative {
                *count += 1;
            } else {
                // Classification flapped: restart the count on the new hint.
                *hint = tentative;
                *count = 1;
            }
            if *count >= self.config.latch_threshold {
                let proto = *hint;
                state.latched.insert(id, proto);
                state.hints.remove(&id);
                tracing::debug!(can_id = format_args!("{id:#x}"), protocol = proto.as_str(), "protocol latched");
                proto
            } else {
                tentative
            }
        };

        // Traffic metrics.
        let entry = state.metrics.entry(effective).or_default();
        entry.0 += 1;
        entry.1 += frame.frame.data.len() as u64;
        entry.2.insert(id);

        // Interval history for this id.
        let window = self.config.pattern_window_ms;
        let history = state.timestamps.entry(id).or_default();
        history.push_back(now);
        while history.len() > self.config.per_id_history {
            history.pop_front();
        }
        while let Some(&oldest) = history.front() {
            if now.saturating_sub(oldest) > window {
                history.pop_front();
            } else {
                break;
            }
        }

        let mut emitted = Vec::new();
        self.check_periodic(&mut state, id, &mut emitted);
        self.check_peer_patterns(&mut state, frame, now, &mut emitted);

        state.patterns_detected += emitted.len() as u64;
        drop(state);

        for pattern in emitted {
            let _ = self.pattern_tx.send(pattern);
        }
        Ok(effective)
    }

    fn check_periodic(
        &self,
        state: &mut AnalyzerState,
        id: u32,
        emitted: &mut Vec<CommunicationPattern>,
    ) {
        let Some(history) = state.timestamps.get(&id) else {
            return;
        };
        if history.len() < self.config.periodic_min_samples {
            return;
        }
        let intervals: Vec<f64> = history
            .iter()
            .zip(history.iter().skip(1))
            .map(|(a, b)| (b - a) as f64)
            .collect();
        if intervals.is_empty() {
            return;
        }
        let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
        if mean <= 0.0 {
            return;
        }
        let variance =
            intervals.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / intervals.len() as f64;
        let std_dev = variance.sqrt();
        if std_dev >= mean * 0.1 {
            return;
        }

        // Suppress re-detection unless the interval moved.
        if let Some(prev) = state.emitted_periodic.get(&id) {
            if (prev - mean).abs() < self.config.periodic_dedup_ms {
                return;
            }
        }
        state.emitted_periodic.insert(id, mean);
        emitted.push(CommunicationPattern::Periodic {
            can_id: id,
            interval_ms: mean,
            confidence: 1.0 - std_dev / mean,
        });
    }

    fn check_peer_patterns(
        &self,
        state: &mut AnalyzerState,
        frame: &DecodedFrame,
        now: u64,
        emitted: &mut Vec<CommunicationPattern>,
    ) {
        let (Some(source), Some(destination)) = (frame.source, frame.destination) else {
            return;
        };
        if destination == codec::BROADCAST_ADDRESS {
            return;
        }
        let window = self.config.pattern_window_ms;

        // Request/response: both directions seen repeatedly.
        let forward = state.pair_counts.entry((source, destination)).or_default();
        forward.push_back(now);
        while let Some(&oldest) = forward.front() {
            if now.saturating_sub(oldest) > window {
                forward.pop_front();
            } else {
                break;
            }
        }
        let forward_count = forward.len();
        let reverse_count = state
            .pair_counts
            .get(&(destination, source))
            .map(|v| v.iter().filter(|&&t| now.saturating_sub(t) <= window).count())
            .unwrap_or(0);
        let key = if source < destination { (source, destination) } else { (destination, source) };
        if forward_count >= 2 && reverse_count >= 2 && !state.emitted_pairs.contains(&key) {
            state.emitted_pairs.insert(key);
            emitted.push(CommunicationPattern::RequestResponse { node_a: key.0, node_b: key.1 });
        }

        // Broadcast: one source fanning out to many destinations.
        let dests = state.destinations.entry(source).or_default();
        dests.insert(destination);
        let count = dests.len();
        if count >= self.config.broadcast_min_destinations {
            let prev = state.emitted_broadcast.get(&source).copied().unwrap_or(0);
            if count > prev {
                state.emitted_broadcast.insert(source, count);
                emitted.push(CommunicationPattern::Broadcast { source, destinations: count });
            }
        }
    }

    /// Latched protocol map (id -> protocol).
    pub fn detected_protocols(&self) -> HashMap<u32, CanProtocol> {
        self.state.lock().latched.clone()
    }

    /// Whether an id's protocol has been latched.
    pub fn is_latched(&self, can_id: u32) -> bool {
        self.state.lock().latched.contains_key(&can_id)
    }

    pub fn statistics(&self) -> AnalyzerStats {
        let state = self.state.lock();
        AnalyzerStats {
            observed_frames: state.observed_frames,
            latched_ids: state.latched.len(),
            patterns_detected: state.patterns_detected,
            per_protocol: state
                .metrics
                .iter()
                .map(|(proto, (count, bytes, ids))| {
                    (
                        proto.as_str().to_owned(),
                        ProtocolMetrics {
                            message_count: *count,
                            byte_count: *bytes,
                            unique_ids: ids.len(),
                        },
                    )
                })
                .collect(),
        }
    }
}

impl SafetyAware for ProtocolAnalyzer {
    fn name(&self) -> &str {
        "protocol_analyzer"
    }

    fn classification(&self) -> SafetyClassification {
        SafetyClassification::Operational
    }

    fn emergency_action(&self) -> EmergencyAction {
        EmergencyAction::EnterSafeMode
    }

    fn safety_status(&self) -> SafetyStatus {
        SafetyStatus {
            service: "protocol_analyzer".to_owned(),
            classification: SafetyClassification::Operational,
            running: self.running.load(std::sync::atomic::Ordering::Acquire),
            emergency_active: self.emergency.is_active(),
            reason: self.emergency.reason(),
        }
    }

    fn emergency_stop(&self, reason: &str) -> futures_util::future::BoxFuture<'_, EmergencyOutcome> {
        self.running.store(false, std::sync::atomic::Ordering::Release);
        tracing::warn!(reason, "protocol analyzer entering safe mode");
        Box::pin(async move { self.emergency_action().outcome() })
    }
}

#[cfg(test)]
#[path = "analyzer_tests.rs"]
mod tests;
