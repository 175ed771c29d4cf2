// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bit-accurate frame codec: J1939/RV-C arbitration-id math, protocol
//! classification, and table-driven decode/encode.
//!
//! Classification here is pure and per-frame; the latched per-id protocol
//! detection (hint counting over repeated observations) lives in the
//! analyzer, which calls back into [`classify`].

use std::sync::Arc;

use crate::error::{CanError, CanResult};
use crate::frame::{epoch_ms, CanFrame, CanProtocol, DecodedFrame, MessageKind, MAX_STANDARD_ID};
use crate::spec::{self, SpecTable};

/// Source address used for frames synthesized by this node.
pub const DEFAULT_SOURCE_ADDRESS: u8 = 0xFE;

/// J1939 global (broadcast) destination address.
pub const BROADCAST_ADDRESS: u8 = 0xFF;

/// RV-C PGN band (data page 1).
pub const RVC_PGN_MIN: u32 = 0x1FE00;
pub const RVC_PGN_MAX: u32 = 0x1FEFF;

/// Addressing fields carried by a 29-bit J1939/RV-C arbitration id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct J1939Header {
    pub priority: u8,
    /// Canonical PGN: the PDU-specific byte is zeroed in PDU1 mode.
    pub pgn: u32,
    pub source: u8,
    /// Resolved destination; `0xFF` for PDU2 broadcast.
    pub destination: u8,
}

impl J1939Header {
    /// Whether the PGN addresses a specific node (PDU1).
    pub fn is_destination_specific(&self) -> bool {
        pdu_format(self.pgn) < 240
    }
}

fn pdu_format(pgn: u32) -> u32 {
    (pgn >> 8) & 0xFF
}

/// Split a 29-bit arbitration id into its J1939 addressing fields.
pub fn split_id(can_id: u32) -> J1939Header {
    let priority = ((can_id >> 26) & 0x07) as u8;
    let raw_pgn = (can_id >> 8) & 0x3FFFF;
    let source = (can_id & 0xFF) as u8;
    if pdu_format(raw_pgn) < 240 {
        J1939Header {
            priority,
            pgn: raw_pgn & 0x3FF00,
            source,
            destination: (raw_pgn & 0xFF) as u8,
        }
    } else {
        J1939Header { priority, pgn: raw_pgn, source, destination: BROADCAST_ADDRESS }
    }
}

/// Synthesize a 29-bit arbitration id from J1939 addressing fields.
///
/// PDU1 PGNs (format < 240) must carry a zero PDU-specific byte; the
/// destination address occupies that byte in the synthesized id. PDU2
/// PGNs broadcast and ignore `destination`.
pub fn encode_id(priority: u8, pgn: u32, source: u8, destination: u8) -> CanResult<u32> {
    if priority > 7 {
        return Err(CanError::invalid_input(format!("priority {priority} exceeds 3 bits")));
    }
    if pgn > 0x3FFFF {
        return Err(CanError::invalid_input(format!("pgn {pgn:#x} exceeds 18 bits")));
    }
    let id = if pdu_format(pgn) < 240 {
        if pgn & 0xFF != 0 {
            return Err(CanError::invalid_input(format!(
                "PDU1 pgn {pgn:#x} has a nonzero PDU-specific byte"
            )));
        }
        ((priority as u32) << 26) | (pgn << 8) | ((destination as u32) << 8) | source as u32
    } else {
        ((priority as u32) << 26) | (pgn << 8) | source as u32
    };
    Ok(id)
}

/// Tentative per-frame protocol classification.
///
/// 29-bit ids in the RV-C PGN band are RV-C; recognized J1939 diagnostic
/// PGNs and the PDU2 broadcast band are J1939; 11-bit ids in CANopen
/// function-code ranges are CANopen; anything else is unknown.
pub fn classify(can_id: u32, extended: bool) -> CanProtocol {
    if extended {
        let raw_pgn = (can_id >> 8) & 0x3FFFF;
        if (RVC_PGN_MIN..=RVC_PGN_MAX).contains(&raw_pgn) {
            return CanProtocol::Rvc;
        }
        if spec::pgn::DIAGNOSTICS.contains(&raw_pgn) || (0xF000..=0xFFFF).contains(&raw_pgn) {
            return CanProtocol::J1939;
        }
        return CanProtocol::Unknown;
    }
    let function_code = (can_id >> 7) & 0x0F;
    if function_code <= 0xB || (0x700..=MAX_STANDARD_ID).contains(&can_id) {
        return CanProtocol::CanOpen;
    }
    CanProtocol::Unknown
}

/// Message-kind heuristic for frames without a spec-table entry.
fn classify_kind(protocol: CanProtocol, can_id: u32) -> MessageKind {
    match protocol {
        CanProtocol::J1939 => {
            let raw_pgn = (can_id >> 8) & 0x3FFFF;
            match raw_pgn {
                0xFECA => MessageKind::Diagnostic,
                0xFECB | 0xFECC => MessageKind::Status,
                0xEF00..=0xEFFF => MessageKind::Data,
                _ => MessageKind::Broadcast,
            }
        }
        CanProtocol::Rvc => {
            if pdu_format((can_id >> 8) & 0x3FFFF) < 240 {
                MessageKind::PeerToPeer
            } else {
                MessageKind::Broadcast
            }
        }
        CanProtocol::CanOpen => match (can_id >> 7) & 0x0F {
            0x0 => MessageKind::Command,
            0x1 => MessageKind::Broadcast,
            0x3..=0x6 => MessageKind::Data,
            0xB | 0xC => MessageKind::PeerToPeer,
            _ => MessageKind::Status,
        },
        CanProtocol::Unknown => MessageKind::Data,
    }
}

/// Table-driven frame codec.
#[derive(Debug, Clone)]
pub struct Codec {
    spec: Arc<SpecTable>,
}

impl Codec {
    pub fn new(spec: Arc<SpecTable>) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &SpecTable {
        &self.spec
    }

    /// Decode a raw frame into addressing, classification, and fields.
    pub fn decode(&self, frame: CanFrame) -> DecodedFrame {
        let protocol = classify(frame.can_id, frame.extended);

        if frame.extended {
            let header = split_id(frame.can_id);
            let def = self.spec.get(header.pgn);
            let fields = def.map(|d| d.decode_fields(&frame.data)).unwrap_or_default();
            let kind = def
                .map(|d| d.kind)
                .unwrap_or_else(|| classify_kind(protocol, frame.can_id));
            DecodedFrame {
                frame,
                protocol,
                kind,
                pgn: Some(header.pgn),
                source: Some(header.source),
                destination: Some(header.destination),
                function_code: None,
                name: def.map(|d| d.name.clone()),
                fields,
            }
        } else {
            let function_code = ((frame.can_id >> 7) & 0x0F) as u8;
            let node_id = (frame.can_id & 0x7F) as u8;
            let kind = classify_kind(protocol, frame.can_id);
            DecodedFrame {
                frame,
                protocol,
                kind,
                pgn: None,
                source: (protocol == CanProtocol::CanOpen).then_some(node_id),
                destination: None,
                function_code: (protocol == CanProtocol::CanOpen).then_some(function_code),
                name: None,
                fields: Vec::new(),
            }
        }
    }

    /// Encode scaled field values into a broadcast frame using the
    /// table's default priority and this node's source address.
    pub fn encode(
        &self,
        interface: impl Into<String>,
        pgn: u32,
        values: &[(&str, f64)],
    ) -> CanResult<CanFrame> {
        self.encode_with(interface, pgn, values, None, DEFAULT_SOURCE_ADDRESS, BROADCAST_ADDRESS)
    }

    /// Encode with explicit addressing.
    pub fn encode_with(
        &self,
        interface: impl Into<String>,
        pgn: u32,
        values: &[(&str, f64)],
        priority: Option<u8>,
        source: u8,
        destination: u8,
    ) -> CanResult<CanFrame> {
        let def = self
            .spec
            .get(pgn)
            .ok_or_else(|| CanError::not_found(format!("pgn {pgn:#x} is not in the spec table")))?;
        let data = def.encode(values)?;
        let can_id = encode_id(priority.unwrap_or(def.priority), pgn, source, destination)?;
        Ok(CanFrame {
            interface: interface.into(),
            can_id,
            extended: true,
            data,
            timestamp_ms: epoch_ms(),
        })
    }

    /// Encode raw field values with explicit addressing.
    pub fn encode_raw(
        &self,
        interface: impl Into<String>,
        pgn: u32,
        values: &[(&str, u32)],
        priority: Option<u8>,
        source: u8,
        destination: u8,
    ) -> CanResult<CanFrame> {
        let def = self
            .spec
            .get(pgn)
            .ok_or_else(|| CanError::not_found(format!("pgn {pgn:#x} is not in the spec table")))?;
        let data = def.encode_raw(values)?;
        let can_id = encode_id(priority.unwrap_or(def.priority), pgn, source, destination)?;
        Ok(CanFrame {
            interface: interface.into(),
            can_id,
            extended: true,
            data,
            timestamp_ms: epoch_ms(),
        })
    }
}

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;
