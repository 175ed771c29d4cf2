// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Frame recorder and timing-preserving replay.
//!
//! Frames are captured into a bounded ring (overwrite-oldest, overflow
//! observable) and saved under the recordings directory as JSONL, CSV,
//! compact binary, or candump-compatible text. Files are opened per
//! save, written, and closed. Replay preserves inter-frame spacing
//! scaled by the speed factor, can remap interfaces, and honors the
//! capture-time filters unless explicitly overridden.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{CanError, CanResult};
use crate::frame::{epoch_ms, CanFrame, MAX_STANDARD_ID};
use crate::ring::Ring;
use crate::safety::{
    EmergencyAction, EmergencyFlag, EmergencyOutcome, SafetyAware, SafetyClassification,
    SafetyStatus,
};

/// Magic prefix of the compact binary format.
const BINARY_MAGIC: &[u8; 4] = b"CLR1";

/// On-disk storage format of a recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingFormat {
    Jsonl,
    Csv,
    Binary,
    Candump,
}

impl RecordingFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jsonl => "jsonl",
            Self::Csv => "csv",
            Self::Binary => "clrec",
            Self::Candump => "log",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "jsonl" => Some(Self::Jsonl),
            "csv" => Some(Self::Csv),
            "clrec" => Some(Self::Binary),
            "log" => Some(Self::Candump),
            _ => None,
        }
    }
}

/// A captured frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedFrame {
    pub timestamp_ms: u64,
    pub interface: String,
    pub can_id: u32,
    pub extended: bool,
    pub data: Vec<u8>,
}

impl RecordedFrame {
    pub fn from_frame(frame: &CanFrame) -> Self {
        Self {
            timestamp_ms: frame.timestamp_ms,
            interface: frame.interface.clone(),
            can_id: frame.can_id,
            extended: frame.extended,
            data: frame.data.clone(),
        }
    }

    /// Rebuild a bus frame, optionally onto a different interface.
    pub fn to_frame(&self, interface: Option<&str>) -> CanFrame {
        CanFrame {
            interface: interface.unwrap_or(&self.interface).to_owned(),
            can_id: self.can_id,
            extended: self.extended,
            data: self.data.clone(),
            timestamp_ms: epoch_ms(),
        }
    }
}

/// Capture-time filter parameters, re-applied at replay unless
/// overridden.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecorderFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_ids: Option<HashSet<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<HashSet<String>>,
}

impl RecorderFilters {
    pub fn accepts(&self, interface: &str, can_id: u32) -> bool {
        if let Some(ref ids) = self.can_ids {
            if !ids.contains(&can_id) {
                return false;
            }
        }
        if let Some(ref ifaces) = self.interfaces {
            if !ifaces.contains(interface) {
                return false;
            }
        }
        true
    }
}

/// Recording session metadata, written as the JSONL header line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingSession {
    pub id: String,
    pub name: String,
    pub format: RecordingFormat,
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub filters: RecorderFilters,
    pub started_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_ms: Option<u64>,
    pub frame_count: u64,
}

/// Recorder lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecorderMode {
    Idle,
    Recording,
    Paused,
}

/// A loaded recording: metadata (when the format carries it) plus the
/// ordered frames.
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub session: Option<RecordingSession>,
    pub frames: Vec<RecordedFrame>,
}

/// Replay tuning.
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    /// Playback speed multiplier; 2.0 halves the wall-clock duration.
    pub speed_factor: f64,
    /// Captured-interface to emission-interface remapping.
    pub interface_map: HashMap<String, String>,
    /// Emit frames the capture filters would have dropped.
    pub override_filters: bool,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self { speed_factor: 1.0, interface_map: HashMap::new(), override_filters: false }
    }
}

/// Per-frame transformation applied before emission.
pub type FrameModifier = Arc<dyn Fn(&mut CanFrame) + Send + Sync>;

/// Replay outcome counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayStats {
    pub emitted: u64,
    pub skipped: u64,
}

#[derive(Debug)]
struct RecorderState {
    mode: RecorderMode,
    session: Option<RecordingSession>,
    ring: Ring<RecordedFrame>,
}

/// Capture and timing-preserved replay of bus traffic.
pub struct CanRecorder {
    dir: PathBuf,
    autosave_interval: Duration,
    state: Mutex<RecorderState>,
    replays: Mutex<HashMap<String, CancellationToken>>,
    emergency: EmergencyFlag,
    running: AtomicBool,
}

impl CanRecorder {
    pub fn new(
        dir: impl Into<PathBuf>,
        capacity: usize,
        autosave_interval: Duration,
        emergency: EmergencyFlag,
    ) -> Self {
        Self {
            dir: dir.into(),
            autosave_interval,
            state: Mutex::new(RecorderState {
                mode: RecorderMode::Idle,
                session: None,
                ring: Ring::new(capacity),
            }),
            replays: Mutex::new(HashMap::new()),
            emergency,
            running: AtomicBool::new(true),
        }
    }

    pub fn mode(&self) -> RecorderMode {
        self.state.lock().mode
    }

    /// Frames discarded by ring overflow since the session started.
    pub fn overflow(&self) -> u64 {
        self.state.lock().ring.overflow()
    }

    /// Begin a new recording session.
    pub fn start_recording(
        &self,
        name: impl Into<String>,
        format: RecordingFormat,
        interfaces: Vec<String>,
        filters: RecorderFilters,
    ) -> CanResult<RecordingSession> {
        self.emergency.guard("start_recording")?;
        if !self.running.load(Ordering::Acquire) {
            return Err(CanError::conflict("recorder is stopped"));
        }
        let mut state = self.state.lock();
        if state.mode != RecorderMode::Idle {
            return Err(CanError::conflict("a recording session is already active"));
        }
        let session = RecordingSession {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            format,
            interfaces,
            filters,
            started_ms: epoch_ms(),
            stopped_ms: None,
            frame_count: 0,
        };
        state.ring.clear();
        state.session = Some(session.clone());
        state.mode = RecorderMode::Recording;
        tracing::info!(session = %session.id, name = %session.name, "recording started");
        Ok(session)
    }

    /// Offer a frame to the active session. Returns true when captured.
    pub fn record(&self, frame: &CanFrame) -> bool {
        let mut state = self.state.lock();
        if state.mode != RecorderMode::Recording {
            return false;
        }
        let Some(ref mut session) = state.session else {
            return false;
        };
        if !session.interfaces.is_empty() && !session.interfaces.contains(&frame.interface) {
            return false;
        }
        if !session.filters.accepts(&frame.interface, frame.can_id) {
            return false;
        }
        session.frame_count += 1;
        state.ring.push(RecordedFrame::from_frame(frame));
        true
    }

    pub fn pause(&self) -> CanResult<()> {
        let mut state = self.state.lock();
        if state.mode != RecorderMode::Recording {
            return Err(CanError::conflict("no active recording to pause"));
        }
        state.mode = RecorderMode::Paused;
        Ok(())
    }

    pub fn resume(&self) -> CanResult<()> {
        let mut state = self.state.lock();
        if state.mode != RecorderMode::Paused {
            return Err(CanError::conflict("no paused recording to resume"));
        }
        state.mode = RecorderMode::Recording;
        Ok(())
    }

    /// Stop the active session and write its final file.
    pub fn stop_recording(&self) -> CanResult<RecordingSession> {
        let (mut session, frames) = {
            let mut state = self.state.lock();
            if state.mode == RecorderMode::Idle {
                return Err(CanError::conflict("no active recording to stop"));
            }
            let session = state
                .session
                .take()
                .ok_or_else(|| CanError::internal("recording state without session"))?;
            state.mode = RecorderMode::Idle;
            let frames = state.ring.snapshot();
            state.ring.clear();
            (session, frames)
        };
        session.stopped_ms = Some(epoch_ms());
        let path = self.save(&session, &frames)?;
        tracing::info!(session = %session.id, frames = frames.len(), path = %path.display(), "recording stopped");
        Ok(session)
    }

    /// Current session metadata, if any.
    pub fn session(&self) -> Option<RecordingSession> {
        self.state.lock().session.clone()
    }

    fn session_path(&self, session: &RecordingSession) -> PathBuf {
        let file = format!("{}_{}.{}", session.name, session.started_ms, session.format.extension());
        self.dir.join(file)
    }

    /// Write a session snapshot. The file is opened, truncated, written,
    /// and closed in one call.
    fn save(&self, session: &RecordingSession, frames: &[RecordedFrame]) -> CanResult<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| CanError::internal(format!("create recordings dir: {e}")))?;
        let path = self.session_path(session);
        let bytes = match session.format {
            RecordingFormat::Jsonl => encode_jsonl(session, frames)?,
            RecordingFormat::Csv => encode_csv(frames),
            RecordingFormat::Binary => encode_binary(frames),
            RecordingFormat::Candump => encode_candump(frames),
        };
        let mut file = std::fs::File::create(&path)
            .map_err(|e| CanError::internal(format!("create {}: {e}", path.display())))?;
        file.write_all(&bytes)
            .map_err(|e| CanError::internal(format!("write {}: {e}", path.display())))?;
        Ok(path)
    }

    /// Load a recording, detecting the format from the file extension.
    pub fn load(&self, path: impl AsRef<Path>) -> CanResult<Recording> {
        let path = path.as_ref();
        let format = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(RecordingFormat::from_extension)
            .ok_or_else(|| {
                CanError::invalid_input(format!("unsupported recording file {}", path.display()))
            })?;
        let bytes = std::fs::read(path)
            .map_err(|_| CanError::not_found(format!("recording {} not found", path.display())))?;
        match format {
            RecordingFormat::Jsonl => decode_jsonl(&bytes),
            RecordingFormat::Csv => decode_csv(&bytes),
            RecordingFormat::Binary => decode_binary(&bytes),
            RecordingFormat::Candump => decode_candump(&bytes),
        }
    }

    /// Recording files currently on disk, sorted by name.
    pub fn list(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .and_then(RecordingFormat::from_extension)
                    .is_some()
            })
            .collect();
        files.sort();
        files
    }

    /// Spawn the autosave task: periodically snapshots the active
    /// session to disk so a crash loses at most one interval.
    pub fn spawn_autosave(self: &Arc<Self>, cancel: CancellationToken) {
        let recorder = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(recorder.autosave_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let (session, frames) = {
                    let state = recorder.state.lock();
                    if state.mode == RecorderMode::Idle {
                        continue;
                    }
                    match state.session {
                        Some(ref s) => (s.clone(), state.ring.snapshot()),
                        None => continue,
                    }
                };
                if let Err(e) = recorder.save(&session, &frames) {
                    tracing::warn!(session = %session.id, err = %e, "autosave failed");
                }
            }
        });
    }

    /// Start a replay onto the transmit queue.
    ///
    /// Inter-frame spacing is preserved, divided by the speed factor.
    /// Returns the replay task id.
    pub fn start_replay(
        self: &Arc<Self>,
        recording: Recording,
        options: ReplayOptions,
        modifier: Option<FrameModifier>,
        transmit: mpsc::Sender<CanFrame>,
    ) -> CanResult<String> {
        self.emergency.guard("start_replay")?;
        if options.speed_factor <= 0.0 {
            return Err(CanError::invalid_input("speed factor must be positive"));
        }
        if recording.frames.is_empty() {
            return Err(CanError::invalid_input("recording contains no frames"));
        }

        let replay_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        self.replays.lock().insert(replay_id.clone(), cancel.clone());

        let recorder = Arc::clone(self);
        let id = replay_id.clone();
        tokio::spawn(async move {
            let stats = recorder
                .run_replay(recording, options, modifier, transmit, cancel)
                .await;
            recorder.replays.lock().remove(&id);
            tracing::info!(replay = %id, emitted = stats.emitted, skipped = stats.skipped, "replay finished");
        });
        Ok(replay_id)
    }

    async fn run_replay(
        &self,
        recording: Recording,
        options: ReplayOptions,
        modifier: Option<FrameModifier>,
        transmit: mpsc::Sender<CanFrame>,
        cancel: CancellationToken,
    ) -> ReplayStats {
        let mut stats = ReplayStats::default();
        let filters = recording.session.as_ref().map(|s| s.filters.clone()).unwrap_or_default();
        let mut prev_ts: Option<u64> = None;

        for recorded in &recording.frames {
            if cancel.is_cancelled() || self.emergency.is_active() {
                break;
            }
            if let Some(prev) = prev_ts {
                let gap_ms = recorded.timestamp_ms.saturating_sub(prev) as f64 / options.speed_factor;
                if gap_ms >= 1.0 {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_micros((gap_ms * 1000.0) as u64)) => {}
                    }
                }
            }
            prev_ts = Some(recorded.timestamp_ms);

            if !options.override_filters && !filters.accepts(&recorded.interface, recorded.can_id) {
                stats.skipped += 1;
                continue;
            }

            let target = options
                .interface_map
                .get(&recorded.interface)
                .map(String::as_str);
            let mut frame = recorded.to_frame(target);
            if let Some(ref modify) = modifier {
                modify(&mut frame);
            }
            match transmit.send(frame).await {
                Ok(()) => stats.emitted += 1,
                Err(_) => break,
            }
        }
        stats
    }

    /// Cancel one replay, or all when `replay_id` is `None`.
    pub fn stop_replay(&self, replay_id: Option<&str>) -> usize {
        let mut replays = self.replays.lock();
        match replay_id {
            Some(id) => match replays.remove(id) {
                Some(token) => {
                    token.cancel();
                    1
                }
                None => 0,
            },
            None => {
                let count = replays.len();
                for (_, token) in replays.drain() {
                    token.cancel();
                }
                count
            }
        }
    }

    pub fn active_replays(&self) -> usize {
        self.replays.lock().len()
    }
}

// -- Format encoders/decoders -------------------------------------------------

fn encode_jsonl(session: &RecordingSession, frames: &[RecordedFrame]) -> CanResult<Vec<u8>> {
    let mut out = Vec::new();
    let header = serde_json::to_string(session)
        .map_err(|e| CanError::internal(format!("serialize session: {e}")))?;
    out.extend_from_slice(header.as_bytes());
    out.push(b'\n');
    for frame in frames {
        let line = serde_json::to_string(frame)
            .map_err(|e| CanError::internal(format!("serialize frame: {e}")))?;
        out.extend_from_slice(line.as_bytes());
        out.push(b'\n');
    }
    Ok(out)
}

fn decode_jsonl(bytes: &[u8]) -> CanResult<Recording> {
    let text = String::from_utf8_lossy(bytes);
    let mut session = None;
    let mut frames = Vec::new();
    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        if i == 0 {
            if let Ok(s) = serde_json::from_str::<RecordingSession>(line) {
                session = Some(s);
                continue;
            }
        }
        let frame: RecordedFrame = serde_json::from_str(line)
            .map_err(|e| CanError::invalid_input(format!("bad recording line {}: {e}", i + 1)))?;
        frames.push(frame);
    }
    Ok(Recording { session, frames })
}

fn encode_csv(frames: &[RecordedFrame]) -> Vec<u8> {
    let mut out = String::from("timestamp_ms,interface,can_id,extended,data\n");
    for frame in frames {
        let data: String = frame.data.iter().map(|b| format!("{b:02X}")).collect();
        out.push_str(&format!(
            "{},{},{:08X},{},{}\n",
            frame.timestamp_ms,
            frame.interface,
            frame.can_id,
            u8::from(frame.extended),
            data
        ));
    }
    out.into_bytes()
}

fn decode_csv(bytes: &[u8]) -> CanResult<Recording> {
    let text = String::from_utf8_lossy(bytes);
    let mut frames = Vec::new();
    for (i, line) in text.lines().enumerate() {
        if i == 0 || line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() != 5 {
            return Err(CanError::invalid_input(format!("bad csv line {}", i + 1)));
        }
        let timestamp_ms = parts[0]
            .parse()
            .map_err(|_| CanError::invalid_input(format!("bad timestamp on line {}", i + 1)))?;
        let can_id = u32::from_str_radix(parts[2], 16)
            .map_err(|_| CanError::invalid_input(format!("bad can id on line {}", i + 1)))?;
        frames.push(RecordedFrame {
            timestamp_ms,
            interface: parts[1].to_owned(),
            can_id,
            extended: parts[3] == "1",
            data: parse_hex(parts[4])
                .ok_or_else(|| CanError::invalid_input(format!("bad data on line {}", i + 1)))?,
        });
    }
    Ok(Recording { session: None, frames })
}

fn encode_binary(frames: &[RecordedFrame]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + frames.len() * 24);
    out.extend_from_slice(BINARY_MAGIC);
    for frame in frames {
        out.extend_from_slice(&frame.timestamp_ms.to_le_bytes());
        out.extend_from_slice(&frame.can_id.to_le_bytes());
        out.push(u8::from(frame.extended));
        let iface = frame.interface.as_bytes();
        out.push(iface.len().min(255) as u8);
        out.extend_from_slice(&iface[..iface.len().min(255)]);
        out.push(frame.data.len() as u8);
        out.extend_from_slice(&frame.data);
    }
    out
}

fn take_bytes<'a>(bytes: &'a [u8], pos: &mut usize, n: usize) -> CanResult<&'a [u8]> {
    let end = *pos + n;
    if end > bytes.len() {
        return Err(CanError::invalid_input("truncated binary recording"));
    }
    let slice = &bytes[*pos..end];
    *pos = end;
    Ok(slice)
}

fn decode_binary(bytes: &[u8]) -> CanResult<Recording> {
    if bytes.len() < 4 || &bytes[..4] != BINARY_MAGIC {
        return Err(CanError::invalid_input("not a canlink binary recording"));
    }
    let mut frames = Vec::new();
    let mut pos = 4usize;
    while pos < bytes.len() {
        let ts = u64::from_le_bytes(
            take_bytes(bytes, &mut pos, 8)?
                .try_into()
                .map_err(|_| CanError::invalid_input("truncated binary recording"))?,
        );
        let can_id = u32::from_le_bytes(
            take_bytes(bytes, &mut pos, 4)?
                .try_into()
                .map_err(|_| CanError::invalid_input("truncated binary recording"))?,
        );
        let extended = take_bytes(bytes, &mut pos, 1)?[0] != 0;
        let iface_len = take_bytes(bytes, &mut pos, 1)?[0] as usize;
        let interface = String::from_utf8_lossy(take_bytes(bytes, &mut pos, iface_len)?).into_owned();
        let data_len = take_bytes(bytes, &mut pos, 1)?[0] as usize;
        let data = take_bytes(bytes, &mut pos, data_len)?.to_vec();
        frames.push(RecordedFrame { timestamp_ms: ts, interface, can_id, extended, data });
    }
    Ok(Recording { session: None, frames })
}

fn encode_candump(frames: &[RecordedFrame]) -> Vec<u8> {
    let mut out = String::new();
    for frame in frames {
        let data: String = frame.data.iter().map(|b| format!("{b:02X}")).collect();
        let id = if frame.extended {
            format!("{:08X}", frame.can_id)
        } else {
            format!("{:03X}", frame.can_id)
        };
        out.push_str(&format!(
            "({}.{:06}) {} {}#{}\n",
            frame.timestamp_ms / 1000,
            (frame.timestamp_ms % 1000) * 1000,
            frame.interface,
            id,
            data
        ));
    }
    out.into_bytes()
}

fn decode_candump(bytes: &[u8]) -> CanResult<Recording> {
    let text = String::from_utf8_lossy(bytes);
    let mut frames = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let bad = || CanError::invalid_input(format!("bad candump line {}", i + 1));
        let mut parts = line.split_whitespace();
        let ts_part = parts.next().ok_or_else(bad)?;
        let interface = parts.next().ok_or_else(bad)?.to_owned();
        let id_data = parts.next().ok_or_else(bad)?;

        let ts = ts_part.trim_start_matches('(').trim_end_matches(')');
        let (secs, micros) = ts.split_once('.').ok_or_else(bad)?;
        let secs: u64 = secs.parse().map_err(|_| bad())?;
        let micros: u64 = micros.parse().map_err(|_| bad())?;
        let timestamp_ms = secs * 1000 + micros / 1000;

        let (id_text, data_text) = id_data.split_once('#').ok_or_else(bad)?;
        let can_id = u32::from_str_radix(id_text, 16).map_err(|_| bad())?;
        let data = parse_hex(data_text).ok_or_else(bad)?;
        frames.push(RecordedFrame {
            timestamp_ms,
            interface,
            can_id,
            extended: id_text.len() > 3 || can_id > MAX_STANDARD_ID,
            data,
        });
    }
    Ok(Recording { session: None, frames })
}

fn parse_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

impl SafetyAware for CanRecorder {
    fn name(&self) -> &str {
        "can_recorder"
    }

    fn classification(&self) -> SafetyClassification {
        SafetyClassification::Operational
    }

    fn emergency_action(&self) -> EmergencyAction {
        EmergencyAction::EnterSafeMode
    }

    fn safety_status(&self) -> SafetyStatus {
        SafetyStatus {
            service: "can_recorder".to_owned(),
            classification: SafetyClassification::Operational,
            running: self.running.load(Ordering::Acquire),
            emergency_active: self.emergency.is_active(),
            reason: self.emergency.reason(),
        }
    }

    fn emergency_stop(&self, reason: &str) -> futures_util::future::BoxFuture<'_, EmergencyOutcome> {
        self.running.store(false, Ordering::Release);
        let stopped = self.stop_replay(None);
        tracing::warn!(reason, stopped_replays = stopped, "recorder entering safe mode");
        Box::pin(async move {
            // Flush the active session if one is running.
            if self.mode() != RecorderMode::Idle {
                if let Err(e) = self.stop_recording() {
                    tracing::warn!(err = %e, "failed to flush recording during emergency stop");
                    return EmergencyOutcome::Failed;
                }
            }
            self.emergency_action().outcome()
        })
    }
}

#[cfg(test)]
#[path = "recorder_tests.rs"]
mod tests;
