// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::codec::{encode_id, Codec, BROADCAST_ADDRESS};
use crate::frame::CanFrame;
use crate::spec::SpecTable;
use std::sync::Arc;

/// Pack one DTC record the way DM1 carries it.
fn dtc_bytes(spn: u32, fmi: u8, oc: u8) -> [u8; 4] {
    [
        (spn & 0xFF) as u8,
        ((spn >> 8) & 0xFF) as u8,
        (((spn >> 16) & 0x07) as u8) << 5 | (fmi & 0x1F),
        oc & 0x7F,
    ]
}

fn dm1_frame(source: u8, lamp_byte: u8, dtcs: &[[u8; 4]], ts: u64) -> DecodedFrame {
    let codec = Codec::new(Arc::new(SpecTable::builtin()));
    let mut data = vec![lamp_byte, 0xFF];
    for dtc in dtcs {
        data.extend_from_slice(dtc);
    }
    data.truncate(8);
    let id = encode_id(6, DM1_PGN, source, BROADCAST_ADDRESS).unwrap();
    let mut frame = CanFrame::new("chassis", id, data).unwrap();
    frame.timestamp_ms = ts;
    codec.decode(frame)
}

#[test]
fn parse_dm1_decodes_lamps_and_codes() {
    // Amber warning on, one DTC: SPN 110 (coolant temp), FMI 0, OC 3.
    let mut data = vec![0b0000_0100, 0xFF];
    data.extend_from_slice(&dtc_bytes(110, 0, 3));

    let (lamps, codes) = parse_dm1(&data).unwrap();
    assert!(lamps.amber_warning);
    assert!(!lamps.red_stop);
    assert!(lamps.any_on());
    assert_eq!(codes.len(), 1);
    assert_eq!(codes[0].spn, 110);
    assert_eq!(codes[0].fmi, 0);
    assert_eq!(codes[0].occurrence_count, 3);
}

#[test]
fn parse_dm1_wide_spn() {
    // 19-bit SPN: 0x7FFFF with FMI 31.
    let mut data = vec![0x00, 0xFF];
    data.extend_from_slice(&dtc_bytes(0x7FFFF, 31, 1));
    let (_, codes) = parse_dm1(&data).unwrap();
    assert_eq!(codes[0].spn, 0x7FFFF);
    assert_eq!(codes[0].fmi, 31);
}

#[test]
fn parse_dm1_skips_padding_records() {
    // No-fault DM1: lamps off, zero DTC.
    let mut data = vec![0x00, 0xFF];
    data.extend_from_slice(&dtc_bytes(0, 0, 0));
    let (lamps, codes) = parse_dm1(&data).unwrap();
    assert!(!lamps.any_on());
    assert!(codes.is_empty());
}

#[test]
fn parse_dm1_rejects_truncated_header() {
    assert!(parse_dm1(&[0x04]).is_err());
}

#[test]
fn registry_tracks_active_faults() {
    let registry = DiagnosticRegistry::new();
    let reported =
        registry.observe(&dm1_frame(0x00, 0b0001_0000, &[dtc_bytes(110, 1, 1)], 1000));
    assert_eq!(reported.len(), 1);

    let active = registry.active();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].source, 0x00);
    assert_eq!(active[0].code.spn, 110);
    assert!(active[0].lamps.red_stop);
    assert_eq!(active[0].first_seen_ms, 1000);
}

#[test]
fn persisting_fault_keeps_first_seen() {
    let registry = DiagnosticRegistry::new();
    registry.observe(&dm1_frame(0x00, 0x04, &[dtc_bytes(110, 1, 1)], 1000));
    registry.observe(&dm1_frame(0x00, 0x04, &[dtc_bytes(110, 1, 2)], 2000));

    let active = registry.active();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].first_seen_ms, 1000);
    assert_eq!(active[0].last_seen_ms, 2000);
    assert_eq!(active[0].code.occurrence_count, 2);
}

#[test]
fn cleared_fault_drops_from_registry() {
    let registry = DiagnosticRegistry::new();
    registry.observe(&dm1_frame(0x00, 0x04, &[dtc_bytes(110, 1, 1)], 1000));
    // Next DM1 from the same source reports a different fault only.
    registry.observe(&dm1_frame(0x00, 0x04, &[dtc_bytes(629, 12, 1)], 2000));

    let active = registry.active();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].code.spn, 629);
}

#[test]
fn sources_are_tracked_independently() {
    let registry = DiagnosticRegistry::new();
    registry.observe(&dm1_frame(0x00, 0x04, &[dtc_bytes(110, 1, 1)], 1000));
    registry.observe(&dm1_frame(0x21, 0x04, &[dtc_bytes(629, 12, 1)], 1000));

    assert_eq!(registry.active().len(), 2);
    assert_eq!(registry.active_for(0x21).len(), 1);

    // A no-fault DM1 from one source leaves the other alone.
    registry.observe(&dm1_frame(0x00, 0x00, &[], 2000));
    assert_eq!(registry.active().len(), 1);
    assert_eq!(registry.active_for(0x00).len(), 0);

    let stats = registry.statistics();
    assert_eq!(stats.dm1_frames, 3);
    assert_eq!(stats.sources_reporting, 1);
}

#[test]
fn clear_source_is_explicit_maintenance() {
    let registry = DiagnosticRegistry::new();
    registry.observe(&dm1_frame(0x00, 0x04, &[dtc_bytes(110, 1, 1)], 1000));
    assert_eq!(registry.clear_source(0x00), 1);
    assert!(registry.active().is_empty());
    assert_eq!(registry.clear_source(0x00), 0);
}

#[test]
fn non_dm1_frames_ignored() {
    let registry = DiagnosticRegistry::new();
    let codec = Codec::new(Arc::new(SpecTable::builtin()));
    let frame = codec.decode(CanFrame::new("can0", 0x18FEE800, vec![0; 8]).unwrap());
    assert!(registry.observe(&frame).is_empty());
    assert_eq!(registry.statistics().dm1_frames, 0);
}
