// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Raw and decoded CAN frame model shared by every canlink service.

use serde::{Deserialize, Serialize};

use crate::error::{CanError, CanResult};

/// Maximum payload of a classic CAN frame.
pub const MAX_FRAME_DATA: usize = 8;

/// Highest valid 11-bit arbitration id.
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Highest valid 29-bit arbitration id.
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// Extended-frame flag (bit 31) set on synthesized 29-bit wire ids.
pub const EFF_FLAG: u32 = 0x8000_0000;

/// Detected protocol variant for a frame or arbitration id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanProtocol {
    Unknown,
    Rvc,
    J1939,
    CanOpen,
}

impl CanProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Rvc => "rvc",
            Self::J1939 => "j1939",
            Self::CanOpen => "canopen",
        }
    }
}

/// Classified message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Data,
    Diagnostic,
    Command,
    Status,
    Broadcast,
    PeerToPeer,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Diagnostic => "diagnostic",
            Self::Command => "command",
            Self::Status => "status",
            Self::Broadcast => "broadcast",
            Self::PeerToPeer => "peer_to_peer",
        }
    }
}

/// A raw CAN frame as read from or written to an interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanFrame {
    /// Logical interface name (`can0`, `house`, ...).
    pub interface: String,
    /// 11- or 29-bit arbitration id without the EFF flag.
    pub can_id: u32,
    /// True for 29-bit ids.
    pub extended: bool,
    /// Payload, at most [`MAX_FRAME_DATA`] bytes.
    pub data: Vec<u8>,
    /// Receive (or synthesis) timestamp, epoch milliseconds.
    pub timestamp_ms: u64,
}

impl CanFrame {
    /// Build a frame stamped now. The extended flag is derived from the id width.
    pub fn new(interface: impl Into<String>, can_id: u32, data: Vec<u8>) -> CanResult<Self> {
        if data.len() > MAX_FRAME_DATA {
            return Err(CanError::invalid_input(format!(
                "payload of {} bytes exceeds classic CAN limit",
                data.len()
            )));
        }
        if can_id > MAX_EXTENDED_ID {
            return Err(CanError::invalid_input(format!("arbitration id {can_id:#x} exceeds 29 bits")));
        }
        Ok(Self {
            interface: interface.into(),
            can_id,
            extended: can_id > MAX_STANDARD_ID,
            data,
            timestamp_ms: epoch_ms(),
        })
    }

    /// Wire-level arbitration id with the EFF flag applied for extended frames.
    pub fn wire_id(&self) -> u32 {
        if self.extended {
            self.can_id | EFF_FLAG
        } else {
            self.can_id
        }
    }
}

/// A single decoded field with both raw and scaled representations.
///
/// `valid` reflects whether the raw value is inside the spec-defined
/// range — not whether scaling succeeded. Sentinel raws decode with
/// `value: None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedField {
    pub name: String,
    pub raw: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub valid: bool,
}

/// A decoded CAN frame with protocol addressing and field breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedFrame {
    pub frame: CanFrame,
    pub protocol: CanProtocol,
    pub kind: MessageKind,
    /// 18-bit parameter group number (J1939/RV-C frames only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pgn: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<u8>,
    /// CANopen function code (11-bit frames only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_code: Option<u8>,
    /// Human-readable message name from the spec table, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub fields: Vec<DecodedField>,
}

impl DecodedFrame {
    /// Look up a decoded field by name.
    pub fn field(&self, name: &str) -> Option<&DecodedField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Raw value of a named field, if present.
    pub fn raw(&self, name: &str) -> Option<u32> {
        self.field(name).map(|f| f.raw)
    }

    /// Scaled value of a named field, if present and valid.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.field(name).and_then(|f| f.value)
    }
}

/// Current time as epoch milliseconds.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;
