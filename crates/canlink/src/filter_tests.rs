// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::codec::Codec;
use crate::frame::CanFrame;
use crate::spec::SpecTable;
use proptest::prelude::*;
use std::sync::Arc;

fn decoded(can_id: u32, data: Vec<u8>) -> DecodedFrame {
    let codec = Codec::new(Arc::new(SpecTable::builtin()));
    codec.decode(CanFrame::new("can0", can_id, data).unwrap())
}

fn filter() -> MessageFilter {
    MessageFilter::new(16, 64, EmergencyFlag::new())
}

fn block_rule(id: &str, priority: i32, pgn: u32) -> FilterRule {
    FilterRule {
        id: id.to_owned(),
        name: format!("block {pgn:#x}"),
        description: String::new(),
        priority,
        enabled: true,
        conditions: vec![FilterCondition::new(
            FilterField::Pgn,
            FilterOp::Eq,
            FilterValue::Number(pgn as u64),
        )],
        logic: ConditionLogic::And,
        actions: vec![FilterAction::Block],
    }
}

#[test]
fn empty_rule_set_passes() {
    let filter = filter();
    let verdict = filter.process(decoded(0x18FEE800, vec![0; 8])).unwrap();
    assert!(!verdict.blocked);
    assert_eq!(filter.statistics().passed, 1);
}

#[test]
fn block_rule_terminates_evaluation() {
    let filter = filter();
    filter.add_rule(block_rule("r1", 50, 0xFEE8)).unwrap();
    // Lower-priority capture rule never runs for blocked frames.
    filter
        .add_rule(FilterRule {
            id: "r2".to_owned(),
            name: "capture all".to_owned(),
            description: String::new(),
            priority: 10,
            enabled: true,
            conditions: vec![],
            logic: ConditionLogic::And,
            actions: vec![FilterAction::Capture],
        })
        .unwrap();

    let verdict = filter.process(decoded(0x18FEE800, vec![0; 8])).unwrap();
    assert!(verdict.blocked);
    assert_eq!(verdict.blocked_by.as_deref(), Some("r1"));
    assert!(filter.captured().is_empty());

    // Non-matching frame falls through to the capture rule.
    let verdict = filter.process(decoded(0x18FEF100, vec![0; 8])).unwrap();
    assert!(!verdict.blocked);
    assert_eq!(filter.captured().len(), 1);
}

#[test]
fn priority_order_wins() {
    let filter = filter();
    filter.add_rule(block_rule("low", 10, 0xFEE8)).unwrap();
    filter.add_rule(block_rule("high", 80, 0xFEE8)).unwrap();
    let verdict = filter.process(decoded(0x18FEE800, vec![0; 8])).unwrap();
    assert_eq!(verdict.blocked_by.as_deref(), Some("high"));
}

#[test]
fn or_logic_matches_any_condition() {
    let filter = filter();
    filter
        .add_rule(FilterRule {
            id: "or".to_owned(),
            name: "either".to_owned(),
            description: String::new(),
            priority: 10,
            enabled: true,
            conditions: vec![
                FilterCondition::new(FilterField::Pgn, FilterOp::Eq, FilterValue::Number(0x1234)),
                FilterCondition::new(
                    FilterField::Interface,
                    FilterOp::Eq,
                    FilterValue::Text("can0".to_owned()),
                ),
            ],
            logic: ConditionLogic::Or,
            actions: vec![FilterAction::Block],
        })
        .unwrap();
    assert!(filter.process(decoded(0x18FEE800, vec![0; 8])).unwrap().blocked);
}

#[test]
fn data_contains_subsequence() {
    let cond = FilterCondition::new(
        FilterField::Data,
        FilterOp::Contains,
        FilterValue::Bytes(vec![0xAA, 0xBB]),
    );
    assert!(cond.evaluate(&decoded(0x18FEE800, vec![0x01, 0xAA, 0xBB, 0x02])));
    assert!(!cond.evaluate(&decoded(0x18FEE800, vec![0xAA, 0x01, 0xBB])));
}

#[test]
fn wildcard_on_protocol() {
    let cond = FilterCondition::new(
        FilterField::Protocol,
        FilterOp::Wildcard,
        FilterValue::Text("j1*".to_owned()),
    );
    assert!(cond.evaluate(&decoded(0x18FEE800, vec![0; 8])));
    assert!(!cond.evaluate(&decoded(0x19FEDB80, vec![0; 8])));
}

#[test]
fn regex_on_interface() {
    let cond = FilterCondition::new(
        FilterField::Interface,
        FilterOp::Matches,
        FilterValue::Text("^can[0-9]$".to_owned()),
    );
    assert!(cond.evaluate(&decoded(0x18FEE800, vec![0; 8])));
}

#[test]
fn in_operator_on_source() {
    let cond = FilterCondition::new(
        FilterField::Source,
        FilterOp::In,
        FilterValue::NumberList(vec![0x00, 0x80]),
    );
    assert!(cond.evaluate(&decoded(0x18FEE800, vec![0; 8])));
    assert!(!cond.evaluate(&decoded(0x18FEE8FE, vec![0; 8])));
}

#[test]
fn modify_patches_payload() {
    let filter = filter();
    filter
        .add_rule(FilterRule {
            id: "mod".to_owned(),
            name: "rewrite byte".to_owned(),
            description: String::new(),
            priority: 10,
            enabled: true,
            conditions: vec![],
            logic: ConditionLogic::And,
            actions: vec![FilterAction::Modify { patches: vec![BytePatch { index: 0, value: 0x7F }] }],
        })
        .unwrap();
    let verdict = filter.process(decoded(0x18FEE800, vec![0x00, 0x01])).unwrap();
    assert_eq!(verdict.frame.frame.data[0], 0x7F);
}

#[test]
fn forward_deduplicates_interfaces() {
    let filter = filter();
    for (id, priority) in [("f1", 20), ("f2", 10)] {
        filter
            .add_rule(FilterRule {
                id: id.to_owned(),
                name: id.to_owned(),
                description: String::new(),
                priority,
                enabled: true,
                conditions: vec![],
                logic: ConditionLogic::And,
                actions: vec![FilterAction::Forward { interface: "can1".to_owned() }],
            })
            .unwrap();
    }
    let verdict = filter.process(decoded(0x18FEE800, vec![0; 8])).unwrap();
    assert_eq!(verdict.forward_to, vec!["can1".to_owned()]);
}

#[test]
fn alert_action_publishes() {
    let filter = filter();
    let mut rx = filter.subscribe_alerts();
    filter
        .add_rule(FilterRule {
            id: "a1".to_owned(),
            name: "alert".to_owned(),
            description: String::new(),
            priority: 10,
            enabled: true,
            conditions: vec![],
            logic: ConditionLogic::And,
            actions: vec![FilterAction::Alert],
        })
        .unwrap();
    filter.process(decoded(0x18FEE800, vec![0; 8])).unwrap();
    let alert = rx.try_recv().unwrap();
    assert_eq!(alert.rule_id, "a1");
    assert_eq!(filter.statistics().alerted, 1);
}

#[test]
fn duplicate_rule_id_conflicts() {
    let filter = filter();
    filter.add_rule(block_rule("dup", 10, 1)).unwrap();
    let err = filter.add_rule(block_rule("dup", 20, 2)).unwrap_err();
    assert_eq!(err.kind, crate::error::CanErrorKind::Conflict);
}

#[test]
fn system_rules_protected() {
    let filter = filter();
    let err = filter.remove_rule("sys.invalid_can_id").unwrap_err();
    assert_eq!(err.kind, crate::error::CanErrorKind::Conflict);
    // They ship disabled but can be enabled.
    filter.set_enabled("sys.invalid_can_id", true).unwrap();
    assert!(filter.rule("sys.invalid_can_id").unwrap().enabled);
}

#[test]
fn rule_limit_enforced() {
    let filter = MessageFilter::new(4, 2, EmergencyFlag::new());
    // One slot is taken by the system rule.
    filter.add_rule(block_rule("r1", 10, 1)).unwrap();
    let err = filter.add_rule(block_rule("r2", 10, 2)).unwrap_err();
    assert_eq!(err.kind, crate::error::CanErrorKind::Conflict);
}

#[test]
fn refuses_while_emergency_active() {
    let flag = EmergencyFlag::new();
    let filter = MessageFilter::new(4, 8, flag.clone());
    flag.set("stop");
    let err = filter.process(decoded(0x18FEE800, vec![0; 8])).unwrap_err();
    assert_eq!(err.kind, crate::error::CanErrorKind::EmergencyStopActive);
}

#[test]
fn export_import_round_trip() {
    let filter = filter();
    filter.add_rule(block_rule("r1", 10, 0xFEE8)).unwrap();
    filter.add_rule(block_rule("r2", 20, 0xFEF1)).unwrap();

    let json = filter.export_rules().unwrap();
    assert!(!json.contains("sys."), "system rules never export");

    let other = MessageFilter::new(16, 64, EmergencyFlag::new());
    assert_eq!(other.import_rules(&json).unwrap(), 2);
    assert!(other.process(decoded(0x18FEE800, vec![0; 8])).unwrap().blocked);

    // Re-import conflicts on the duplicate ids.
    let err = other.import_rules(&json).unwrap_err();
    assert_eq!(err.kind, crate::error::CanErrorKind::Conflict);
}

#[test]
fn import_rejects_system_prefix() {
    let filter = filter();
    let json = r#"[{"id": "sys.smuggled", "name": "x", "priority": 1,
                    "conditions": [], "actions": [{"action": "block"}]}]"#;
    let err = filter.import_rules(json).unwrap_err();
    assert_eq!(err.kind, crate::error::CanErrorKind::InvalidInput);
}

proptest! {
    // Removing any pass-only rule never changes the block outcome.
    #[test]
    fn pass_only_rules_are_order_independent(
        priorities in proptest::collection::vec(0i32..100, 1..5),
        block_pgn in prop_oneof![Just(0xFEE8u32), Just(0xFEF1u32)],
    ) {
        let build = |skip: Option<usize>| {
            let filter = MessageFilter::new(16, 64, EmergencyFlag::new());
            filter.add_rule(block_rule("blocker", 50, block_pgn)).unwrap();
            for (i, priority) in priorities.iter().enumerate() {
                if Some(i) == skip {
                    continue;
                }
                filter
                    .add_rule(FilterRule {
                        id: format!("pass-{i}"),
                        name: format!("pass {i}"),
                        description: String::new(),
                        priority: *priority,
                        enabled: true,
                        conditions: vec![],
                        logic: ConditionLogic::And,
                        actions: vec![FilterAction::Pass, FilterAction::Log],
                    })
                    .unwrap();
            }
            filter
        };

        let frame = decoded(0x18FEE800, vec![0; 8]);
        let baseline = build(None).process(frame.clone()).unwrap().blocked;
        for skip in 0..priorities.len() {
            let outcome = build(Some(skip)).process(frame.clone()).unwrap().blocked;
            prop_assert_eq!(outcome, baseline);
        }
    }
}
