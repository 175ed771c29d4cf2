// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Table-driven PGN definitions: field layouts, scaling factors, and
//! valid ranges. The built-in table covers the RV-C device DGNs the coach
//! mapping routes to plus the J1939 diagnostics the detector recognizes;
//! deployments extend it from the config file and user entries shadow
//! built-ins on PGN collision.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{CanError, CanResult};
use crate::frame::{DecodedField, MessageKind, MAX_FRAME_DATA};

/// Well-known RV-C DGNs carried in the built-in table.
pub mod dgn {
    pub const DC_DIMMER_COMMAND_2: u32 = 0x1FEDB;
    pub const DC_DIMMER_STATUS: u32 = 0x1FEDA;
    pub const SLIDE_COMMAND: u32 = 0x1FEE5;
    pub const SLIDE_STATUS: u32 = 0x1FEE4;
    pub const AWNING_COMMAND: u32 = 0x1FEC1;
    pub const AWNING_STATUS: u32 = 0x1FEC0;
    pub const TANK_STATUS: u32 = 0x1FEB8;
    pub const THERMOSTAT_COMMAND: u32 = 0x1FEA6;
    pub const THERMOSTAT_STATUS: u32 = 0x1FEA5;
    pub const CHASSIS_MOBILITY_STATUS: u32 = 0x1FED4;
}

/// Well-known J1939 PGNs.
pub mod pgn {
    pub const ENGINE_TEMPERATURE: u32 = 0xFEE8;
    pub const CRUISE_VEHICLE_SPEED: u32 = 0xFEF1;

    /// Diagnostic PGNs used for protocol detection.
    pub const DIAGNOSTICS: [u32; 7] = [0xFECA, 0xFEDA, 0xFEDB, 0xFEE6, 0xFEE7, 0xFEE8, 0xFEE9];
}

/// Layout and scaling of a single field within an 8-byte payload.
///
/// Bit addressing is little-endian over the payload viewed as a 64-bit
/// little-endian integer, the J1939 packing convention. Scaled value is
/// `raw * scale + offset`. The default valid range excludes the all-ones
/// sentinel ("not available") for fields of 2 bits or more.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub offset_bits: u16,
    pub length_bits: u8,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default)]
    pub valid_min: u32,
    /// Explicit upper bound on raw validity; defaults by field width.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_max: Option<u32>,
}

fn default_scale() -> f64 {
    1.0
}

impl FieldDef {
    pub fn new(name: impl Into<String>, offset_bits: u16, length_bits: u8) -> Self {
        Self {
            name: name.into(),
            offset_bits,
            length_bits,
            scale: 1.0,
            offset: 0.0,
            unit: None,
            valid_min: 0,
            valid_max: None,
        }
    }

    pub fn scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn valid_range(mut self, min: u32, max: u32) -> Self {
        self.valid_min = min;
        self.valid_max = Some(max);
        self
    }

    /// All-ones mask for this field's width.
    pub fn mask(&self) -> u32 {
        if self.length_bits >= 32 {
            u32::MAX
        } else {
            (1u32 << self.length_bits) - 1
        }
    }

    /// Effective upper validity bound. Single-bit fields have no sentinel.
    pub fn valid_max(&self) -> u32 {
        match self.valid_max {
            Some(max) => max,
            None if self.length_bits <= 1 => self.mask(),
            None => self.mask() - 1,
        }
    }

    /// Whether a raw value is inside the spec-defined range.
    pub fn is_valid(&self, raw: u32) -> bool {
        raw >= self.valid_min && raw <= self.valid_max()
    }

    /// Scaled engineering value for a raw reading.
    pub fn scaled(&self, raw: u32) -> f64 {
        raw as f64 * self.scale + self.offset
    }

    /// Invert the scaling: engineering value back to a raw field value.
    ///
    /// Fails with `OutOfRange` when the rounded raw does not fit the
    /// field width.
    pub fn raw_from_scaled(&self, scaled: f64) -> CanResult<u32> {
        if self.scale == 0.0 {
            return Err(CanError::internal(format!("field {} has zero scale", self.name)));
        }
        let raw = ((scaled - self.offset) / self.scale).round();
        if raw < 0.0 || raw > self.mask() as f64 {
            return Err(CanError::out_of_range(format!(
                "value {scaled} does not fit field {} ({} bits)",
                self.name, self.length_bits
            )));
        }
        Ok(raw as u32)
    }

    /// Decode this field out of a payload.
    pub fn decode(&self, data: &[u8]) -> DecodedField {
        let raw = extract_bits(data, self.offset_bits, self.length_bits);
        let valid = self.is_valid(raw);
        DecodedField {
            name: self.name.clone(),
            raw,
            value: valid.then(|| self.scaled(raw)),
            unit: self.unit.clone(),
            valid,
        }
    }
}

/// Extract a little-endian bit window from a payload.
///
/// Out-of-payload bits read as zero so short frames decode their leading
/// fields and report trailing fields as raw zero.
pub fn extract_bits(data: &[u8], offset_bits: u16, length_bits: u8) -> u32 {
    if offset_bits >= 64 || length_bits == 0 {
        return 0;
    }
    let mut padded = [0u8; MAX_FRAME_DATA];
    let take = data.len().min(MAX_FRAME_DATA);
    padded[..take].copy_from_slice(&data[..take]);
    let word = u64::from_le_bytes(padded);
    let mask = if length_bits >= 64 { u64::MAX } else { (1u64 << length_bits) - 1 };
    ((word >> offset_bits) & mask) as u32
}

/// Pack a raw value into a little-endian bit window of a payload.
pub fn pack_bits(data: &mut [u8; MAX_FRAME_DATA], offset_bits: u16, length_bits: u8, value: u32) {
    if offset_bits >= 64 || length_bits == 0 {
        return;
    }
    let mask = if length_bits >= 64 { u64::MAX } else { (1u64 << length_bits) - 1 };
    let mut word = u64::from_le_bytes(*data);
    word &= !(mask << offset_bits);
    word |= (value as u64 & mask) << offset_bits;
    *data = word.to_le_bytes();
}

/// A parameter group definition: identity, classification, and layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PgnDef {
    pub pgn: u32,
    pub name: String,
    pub kind: MessageKind,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_length")]
    pub length: u8,
    pub fields: Vec<FieldDef>,
}

fn default_priority() -> u8 {
    6
}

fn default_length() -> u8 {
    MAX_FRAME_DATA as u8
}

impl PgnDef {
    pub fn new(pgn: u32, name: impl Into<String>, kind: MessageKind, fields: Vec<FieldDef>) -> Self {
        Self { pgn, name: name.into(), kind, priority: default_priority(), length: default_length(), fields }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Decode every field in layout order.
    pub fn decode_fields(&self, data: &[u8]) -> Vec<DecodedField> {
        self.fields.iter().map(|f| f.decode(data)).collect()
    }

    /// Encode scaled engineering values into a payload.
    ///
    /// Unset bits stay at the RV-C "no change / not available" fill of
    /// all-ones. Unknown field names fail `InvalidInput`.
    pub fn encode(&self, values: &[(&str, f64)]) -> CanResult<Vec<u8>> {
        let mut raws = Vec::with_capacity(values.len());
        for (name, scaled) in values {
            let field = self
                .field(name)
                .ok_or_else(|| CanError::invalid_input(format!("{} has no field {name}", self.name)))?;
            raws.push((*name, field.raw_from_scaled(*scaled)?));
        }
        self.encode_raw(&raws)
    }

    /// Encode raw field values into a payload.
    pub fn encode_raw(&self, values: &[(&str, u32)]) -> CanResult<Vec<u8>> {
        let mut data = [0xFFu8; MAX_FRAME_DATA];
        for (name, raw) in values {
            let field = self
                .field(name)
                .ok_or_else(|| CanError::invalid_input(format!("{} has no field {name}", self.name)))?;
            if *raw > field.mask() {
                return Err(CanError::out_of_range(format!(
                    "raw {raw} does not fit field {name} ({} bits)",
                    field.length_bits
                )));
            }
            pack_bits(&mut data, field.offset_bits, field.length_bits, *raw);
        }
        Ok(data[..self.length as usize].to_vec())
    }
}

/// The authoritative PGN table: built-ins plus config extensions.
#[derive(Debug, Clone, Default)]
pub struct SpecTable {
    by_pgn: HashMap<u32, PgnDef>,
}

impl SpecTable {
    /// Empty table (tests and custom deployments).
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in RV-C/J1939 table.
    pub fn builtin() -> Self {
        let mut table = Self::default();
        for def in builtin_defs() {
            table.insert(def);
        }
        table
    }

    /// Insert or replace a definition.
    pub fn insert(&mut self, def: PgnDef) {
        self.by_pgn.insert(def.pgn, def);
    }

    /// Merge config-provided extensions over the current table.
    pub fn merge(&mut self, extensions: Vec<PgnDef>) {
        for def in extensions {
            self.insert(def);
        }
    }

    pub fn get(&self, pgn: u32) -> Option<&PgnDef> {
        self.by_pgn.get(&pgn)
    }

    pub fn len(&self) -> usize {
        self.by_pgn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pgn.is_empty()
    }

    /// All known PGNs, unordered.
    pub fn pgns(&self) -> impl Iterator<Item = u32> + '_ {
        self.by_pgn.keys().copied()
    }
}

/// Percent scaling used by RV-C level fields (0.4 %/bit, raw 250 = 100%).
const PCT: f64 = 0.4;

/// 16-bit temperature scaling shared by RV-C and J1939 (K/32 with the
/// absolute-zero offset).
const TEMP_SCALE: f64 = 0.03125;
const TEMP_OFFSET: f64 = -273.15;

/// Speed in km/h at 1/256 resolution.
const SPEED_SCALE: f64 = 0.003_906_25;

fn builtin_defs() -> Vec<PgnDef> {
    vec![
        PgnDef::new(
            dgn::DC_DIMMER_COMMAND_2,
            "DC_DIMMER_COMMAND_2",
            MessageKind::Command,
            vec![
                FieldDef::new("instance", 0, 8),
                FieldDef::new("group", 8, 8),
                FieldDef::new("brightness", 16, 8).scale(PCT).unit("%").valid_range(0, 250),
                FieldDef::new("command", 24, 8),
                FieldDef::new("duration", 32, 8),
            ],
        ),
        PgnDef::new(
            dgn::DC_DIMMER_STATUS,
            "DC_DIMMER_STATUS",
            MessageKind::Status,
            vec![
                FieldDef::new("instance", 0, 8),
                FieldDef::new("group", 8, 8),
                FieldDef::new("brightness", 16, 8).scale(PCT).unit("%").valid_range(0, 250),
                FieldDef::new("enable_status", 24, 2),
                FieldDef::new("lock_status", 26, 2),
            ],
        ),
        PgnDef::new(
            dgn::SLIDE_COMMAND,
            "SLIDE_COMMAND",
            MessageKind::Command,
            vec![
                FieldDef::new("instance", 0, 8),
                // 0 = stop, 1 = extend, 2 = retract
                FieldDef::new("command", 8, 4),
                FieldDef::new("duration", 16, 8),
            ],
        ),
        PgnDef::new(
            dgn::SLIDE_STATUS,
            "SLIDE_STATUS",
            MessageKind::Status,
            vec![
                FieldDef::new("instance", 0, 8),
                // 0 = stopped, 1 = extending, 2 = retracting
                FieldDef::new("motion", 8, 4),
                FieldDef::new("position", 16, 8).scale(PCT).unit("%").valid_range(0, 250),
            ],
        ),
        PgnDef::new(
            dgn::AWNING_COMMAND,
            "AWNING_COMMAND",
            MessageKind::Command,
            vec![
                FieldDef::new("instance", 0, 8),
                FieldDef::new("command", 8, 4),
                FieldDef::new("position", 16, 8).scale(PCT).unit("%").valid_range(0, 250),
            ],
        ),
        PgnDef::new(
            dgn::AWNING_STATUS,
            "AWNING_STATUS",
            MessageKind::Status,
            vec![
                FieldDef::new("instance", 0, 8),
                FieldDef::new("motion", 8, 4),
                FieldDef::new("position", 16, 8).scale(PCT).unit("%").valid_range(0, 250),
            ],
        ),
        PgnDef::new(
            dgn::TANK_STATUS,
            "TANK_STATUS",
            MessageKind::Status,
            vec![
                FieldDef::new("instance", 0, 8),
                // 0 = fresh, 1 = black, 2 = gray, 3 = lpg
                FieldDef::new("tank_type", 8, 4),
                FieldDef::new("level", 16, 8).scale(PCT).unit("%").valid_range(0, 250),
                FieldDef::new("capacity", 24, 16).unit("l"),
            ],
        ),
        PgnDef::new(
            dgn::THERMOSTAT_COMMAND,
            "THERMOSTAT_COMMAND",
            MessageKind::Command,
            vec![
                FieldDef::new("instance", 0, 8),
                FieldDef::new("mode", 8, 4),
                FieldDef::new("fan_speed", 12, 4),
                FieldDef::new("setpoint_heat", 16, 16).scale(TEMP_SCALE).offset(TEMP_OFFSET).unit("deg_c"),
                FieldDef::new("setpoint_cool", 32, 16).scale(TEMP_SCALE).offset(TEMP_OFFSET).unit("deg_c"),
            ],
        ),
        PgnDef::new(
            dgn::THERMOSTAT_STATUS,
            "THERMOSTAT_STATUS",
            MessageKind::Status,
            vec![
                FieldDef::new("instance", 0, 8),
                FieldDef::new("mode", 8, 4),
                FieldDef::new("fan_speed", 12, 4),
                FieldDef::new("ambient", 16, 16).scale(TEMP_SCALE).offset(TEMP_OFFSET).unit("deg_c"),
                FieldDef::new("setpoint", 32, 16).scale(TEMP_SCALE).offset(TEMP_OFFSET).unit("deg_c"),
            ],
        ),
        PgnDef::new(
            dgn::CHASSIS_MOBILITY_STATUS,
            "CHASSIS_MOBILITY_STATUS",
            MessageKind::Status,
            vec![
                FieldDef::new("speed", 0, 16).scale(SPEED_SCALE).unit("km/h"),
                // 0 = released, 1 = engaged
                FieldDef::new("parking_brake", 16, 2),
                // 0 = retracted, 1 = deployed
                FieldDef::new("leveling_jacks", 18, 2),
                FieldDef::new("ignition", 20, 2),
            ],
        ),
        PgnDef::new(
            pgn::ENGINE_TEMPERATURE,
            "ENGINE_TEMPERATURE",
            MessageKind::Status,
            vec![FieldDef::new("engine_coolant_temperature", 0, 16)
                .scale(TEMP_SCALE)
                .offset(TEMP_OFFSET)
                .unit("deg_c")],
        ),
        PgnDef::new(
            pgn::CRUISE_VEHICLE_SPEED,
            "CRUISE_VEHICLE_SPEED",
            MessageKind::Status,
            vec![
                FieldDef::new("parking_brake", 2, 2),
                FieldDef::new("wheel_speed", 8, 16).scale(SPEED_SCALE).unit("km/h"),
            ],
        ),
    ]
}

#[cfg(test)]
#[path = "spec_tests.rs"]
mod tests;
