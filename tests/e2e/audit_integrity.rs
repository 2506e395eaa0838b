//! Audit chain integrity across a running service.
//!
//! A tampered history, found on restore or on the next mutation, halts every
//! state change until an operator acknowledges the break.

mod common;

use common::{day, World};
use deadhand_audit::{AuditChain, AuditError};
use deadhand_core::ChannelKind;
use deadhand_inherit::{CaseState, SuccessionError};
use serde_json::json;

fn tampered(world: &World, sequence: usize) -> AuditChain {
    let mut entries = world.audit.entries();
    entries[sequence - 1].payload = json!({"event": "case_transition", "to": "ABORTED"});
    AuditChain::restore(entries)
}

#[test]
fn test_every_mutation_is_chained() {
    let world = World::new();
    let verified = world.verify_by_silence();
    world.service.poll(day(182)).unwrap();

    let entries = world.audit.entries();
    for pair in entries.windows(2) {
        assert_eq!(pair[1].prev_hash, pair[0].hash);
        assert_eq!(pair[1].sequence, pair[0].sequence + 1);
    }

    let events: Vec<&str> = entries.iter().filter_map(|e| e.event()).collect();
    assert_eq!(
        events.iter().filter(|e| **e == "channel_verified").count(),
        2
    );
    assert_eq!(events.iter().filter(|e| **e == "shard_accepted").count(), 2);
    assert_eq!(events.iter().filter(|e| **e == "step_completed").count(), 4);

    // Shard values never reach the log
    for entry in &entries {
        assert!(entry.payload.get("value").is_none());
    }
    assert!(entries
        .iter()
        .all(|e| e.payload.get("case_id").map_or(true, |id| id == verified.id.as_str())));
}

#[test]
fn test_tampered_history_halts_state_changes() {
    let mut world = World::new();
    let verified = world.verify_by_silence();
    let length = world.audit.len();

    world.restart_with_audit(tampered(&world, 3));
    assert!(world.audit.is_halted());

    // Advancing, checking in and polling all refuse
    assert!(matches!(
        world
            .service
            .advance_case(&verified.id, verified.epoch, day(182)),
        Err(SuccessionError::AuditIntegrityViolation { sequence: 3 })
    ));
    assert!(matches!(
        world.service.poll(day(182)),
        Err(SuccessionError::AuditIntegrityViolation { sequence: 3 })
    ));
    assert_eq!(world.audit.len(), length);

    // Nothing moved
    let case = world.service.orchestrator().case(&verified.id).unwrap();
    assert_eq!(case.state, CaseState::Verified);

    // Operator signs off; the break stays on record
    world.audit.acknowledge_break("ops@example.com").unwrap();
    assert_eq!(
        world.audit.verify_integrity(),
        Err(AuditError::IntegrityViolation { sequence: 3 })
    );

    let done = world
        .service
        .advance_case(&verified.id, verified.epoch, day(183))
        .unwrap();
    assert_eq!(done.state, CaseState::Complete);
    assert!(world.audit.len() > length + 1);
}

#[test]
fn test_restored_break_refuses_callbacks() {
    let mut world = World::new();
    let report = world.service.poll(day(181)).unwrap();
    let case = world.service.orchestrator().case(&report.opened[0]).unwrap();

    let mut entries = world.audit.entries();
    entries[0].hash = "ff".repeat(32);
    world.restart_with_audit(AuditChain::restore(entries));

    let result = world
        .service
        .verify_channel(&case.id, case.epoch, ChannelKind::Email, day(181));
    assert!(matches!(
        result,
        Err(SuccessionError::AuditIntegrityViolation { sequence: 1 })
    ));

    let status = world.service.get_case_status(&case.id, day(181)).unwrap();
    assert_eq!(status.quorum.verified, 0);
}

#[test]
fn test_forgery_after_acknowledgement_halts_again() {
    let mut world = World::new();
    let verified = world.verify_by_silence();
    world.restart_with_audit(tampered(&world, 3));
    world.audit.acknowledge_break("ops@example.com").unwrap();
    let length = world.audit.len();
    assert!(length > 5);

    // Rewrite the last entry written before the acknowledgement
    let mut entries = world.audit.entries();
    let forged = (length - 1) as u64;
    entries[length - 2].payload = json!({"event": "case_transition", "to": "COMPLETE"});
    world.restart_with_audit(AuditChain::restore(entries));

    assert!(world.audit.is_halted());
    assert!(matches!(
        world
            .service
            .advance_case(&verified.id, verified.epoch, day(182)),
        Err(SuccessionError::AuditIntegrityViolation { sequence }) if sequence == forged
    ));
    assert_eq!(
        world.service.orchestrator().case(&verified.id).unwrap().state,
        CaseState::Verified
    );
}
