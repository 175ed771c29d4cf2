// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! J1939 diagnostic message handling.
//!
//! DM1 (active diagnostic trouble codes, PGN 0xFECA) carries the lamp
//! status in the first two bytes followed by 4-byte DTC records. Each
//! DM1 from a source lists that source's complete active set, so the
//! registry replaces the source's entries on every message while
//! preserving first-seen timestamps for persisting faults.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{CanError, CanResult};
use crate::frame::DecodedFrame;

/// PGN of DM1, active diagnostic trouble codes.
pub const DM1_PGN: u32 = 0xFECA;

/// Lamp command state decoded from the DM1 header bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LampStatus {
    pub protect: bool,
    pub amber_warning: bool,
    pub red_stop: bool,
    pub malfunction: bool,
}

impl LampStatus {
    /// Two bits per lamp; `01` commands the lamp on.
    fn from_byte(byte: u8) -> Self {
        let on = |shift: u8| (byte >> shift) & 0b11 == 0b01;
        Self {
            protect: on(0),
            amber_warning: on(2),
            red_stop: on(4),
            malfunction: on(6),
        }
    }

    pub fn any_on(&self) -> bool {
        self.protect || self.amber_warning || self.red_stop || self.malfunction
    }
}

/// One diagnostic trouble code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TroubleCode {
    /// Suspect parameter number (19 bits).
    pub spn: u32,
    /// Failure mode identifier (5 bits).
    pub fmi: u8,
    /// SPN conversion method flag.
    pub conversion_method: bool,
    /// Occurrence count (7 bits, 0x7F = not available).
    pub occurrence_count: u8,
}

impl TroubleCode {
    /// Decode one 4-byte DTC record (version-4 SPN packing).
    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 4 {
            return None;
        }
        let spn =
            bytes[0] as u32 | (bytes[1] as u32) << 8 | (((bytes[2] >> 5) & 0x07) as u32) << 16;
        let fmi = bytes[2] & 0x1F;
        if spn == 0 && fmi == 0 {
            // Padding record: no fault.
            return None;
        }
        Some(Self {
            spn,
            fmi,
            conversion_method: bytes[3] & 0x80 != 0,
            occurrence_count: bytes[3] & 0x7F,
        })
    }
}

/// Parse a DM1 payload into lamp status and trouble codes.
pub fn parse_dm1(data: &[u8]) -> CanResult<(LampStatus, Vec<TroubleCode>)> {
    if data.len() < 2 {
        return Err(CanError::invalid_input("DM1 payload shorter than the lamp header"));
    }
    let lamps = LampStatus::from_byte(data[0]);
    let mut codes = Vec::new();
    for chunk in data[2..].chunks(4) {
        if let Some(code) = TroubleCode::from_bytes(chunk) {
            codes.push(code);
        }
    }
    Ok((lamps, codes))
}

/// An active fault tracked against its reporting source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveFault {
    pub source: u8,
    pub code: TroubleCode,
    pub lamps: LampStatus,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
}

/// Diagnostic counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticStats {
    pub dm1_frames: u64,
    pub active_faults: usize,
    pub sources_reporting: usize,
}

/// Registry of currently active trouble codes across the bus.
#[derive(Debug, Default)]
pub struct DiagnosticRegistry {
    active: Mutex<HashMap<(u8, u32, u8), ActiveFault>>,
    dm1_frames: std::sync::atomic::AtomicU64,
}

impl DiagnosticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a decoded frame into the registry. Non-DM1 frames are
    /// ignored; returns the faults the frame reported.
    pub fn observe(&self, frame: &DecodedFrame) -> Vec<ActiveFault> {
        if frame.pgn != Some(DM1_PGN) {
            return Vec::new();
        }
        let Some(source) = frame.source else {
            return Vec::new();
        };
        let Ok((lamps, codes)) = parse_dm1(&frame.frame.data) else {
            return Vec::new();
        };
        self.dm1_frames.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let now = frame.frame.timestamp_ms;

        let mut active = self.active.lock();
        // DM1 is the complete active set for its source: entries the
        // message no longer lists have cleared.
        let listed: Vec<(u8, u32, u8)> =
            codes.iter().map(|c| (source, c.spn, c.fmi)).collect();
        active.retain(|key, fault| fault.source != source || listed.contains(key));

        let mut reported = Vec::with_capacity(codes.len());
        for code in codes {
            let key = (source, code.spn, code.fmi);
            let fault = active
                .entry(key)
                .and_modify(|fault| {
                    fault.last_seen_ms = now;
                    fault.lamps = lamps;
                    fault.code = code;
                })
                .or_insert_with(|| {
                    tracing::warn!(
                        source = format_args!("{source:#04x}"),
                        spn = code.spn,
                        fmi = code.fmi,
                        "active trouble code reported"
                    );
                    ActiveFault { source, code, lamps, first_seen_ms: now, last_seen_ms: now }
                });
            reported.push(fault.clone());
        }
        reported
    }

    /// Every active fault, ordered by source then SPN.
    pub fn active(&self) -> Vec<ActiveFault> {
        let mut faults: Vec<ActiveFault> = self.active.lock().values().cloned().collect();
        faults.sort_by_key(|f| (f.source, f.code.spn, f.code.fmi));
        faults
    }

    /// Active faults from one source address.
    pub fn active_for(&self, source: u8) -> Vec<ActiveFault> {
        self.active().into_iter().filter(|f| f.source == source).collect()
    }

    /// Drop every fault from a source (maintenance operation).
    pub fn clear_source(&self, source: u8) -> usize {
        let mut active = self.active.lock();
        let before = active.len();
        active.retain(|_, fault| fault.source != source);
        before - active.len()
    }

    pub fn statistics(&self) -> DiagnosticStats {
        let active = self.active.lock();
        let sources: std::collections::HashSet<u8> =
            active.values().map(|f| f.source).collect();
        DiagnosticStats {
            dm1_frames: self.dm1_frames.load(std::sync::atomic::Ordering::Relaxed),
            active_faults: active.len(),
            sources_reporting: sources.len(),
        }
    }
}

#[cfg(test)]
#[path = "diagnostics_tests.rs"]
mod tests;
