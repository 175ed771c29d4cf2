// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn extended_flag_from_id_width() {
    let std_frame = CanFrame::new("can0", 0x123, vec![0; 8]).unwrap();
    assert!(!std_frame.extended);
    assert_eq!(std_frame.wire_id(), 0x123);

    let ext_frame = CanFrame::new("can0", 0x18FEF100, vec![0; 8]).unwrap();
    assert!(ext_frame.extended);
    assert_eq!(ext_frame.wire_id(), 0x18FEF100 | EFF_FLAG);
}

#[test]
fn oversized_payload_rejected() {
    let err = CanFrame::new("can0", 0x123, vec![0; 9]).unwrap_err();
    assert_eq!(err.kind, crate::error::CanErrorKind::InvalidInput);
}

#[test]
fn id_wider_than_29_bits_rejected() {
    let err = CanFrame::new("can0", 0x2000_0000, vec![]).unwrap_err();
    assert_eq!(err.kind, crate::error::CanErrorKind::InvalidInput);
}

#[test]
fn field_lookup_by_name() {
    let frame = CanFrame::new("can0", 0x18FEE800, vec![0x10, 0x27, 0, 0, 0, 0, 0, 0]).unwrap();
    let decoded = DecodedFrame {
        frame,
        protocol: CanProtocol::J1939,
        kind: MessageKind::Status,
        pgn: Some(0xFEE8),
        source: Some(0),
        destination: Some(0xFF),
        function_code: None,
        name: None,
        fields: vec![DecodedField {
            name: "engine_coolant_temperature".to_owned(),
            raw: 10000,
            value: Some(39.35),
            unit: Some("deg_c".to_owned()),
            valid: true,
        }],
    };

    assert_eq!(decoded.raw("engine_coolant_temperature"), Some(10000));
    assert_eq!(decoded.value("engine_coolant_temperature"), Some(39.35));
    assert!(decoded.field("missing").is_none());
}
