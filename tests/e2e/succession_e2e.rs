//! End-to-end succession scenarios.
//!
//! 1. Silence escalates through reminders to a completed settlement
//! 2. A check-in aborts an unverified case and invalidates its callbacks
//! 3. A deadlocked settlement step is force-liquidated after 90 days
//! 4. A hanging collaborator times out and the step is retried
//! 5. A death report opens a case without waiting for silence

mod common;

use common::{day, World};
use deadhand_core::ChannelKind;
use deadhand_inherit::{
    CaseState, DeathVerificationEvent, LiquidationDecision, LivenessState, StepKind, StepStatus,
    SuccessionError,
};
use deadhand_notify::NotificationLevel;
use std::sync::atomic::Ordering;

// ============================================================================
// 1. Escalation to completion
// ============================================================================

#[test]
fn test_escalation_ladder_to_completed_settlement() {
    let world = World::new();

    // 0..89 days: nothing happens
    let report = world.service.poll(day(89)).unwrap();
    assert!(report.reminded.is_empty());
    assert_eq!(report.statuses[0].state, LivenessState::Active);

    // 91 days: overdue reminder
    let report = world.service.poll(day(91)).unwrap();
    assert_eq!(report.statuses[0].state, LivenessState::Overdue);
    assert_eq!(report.reminded, vec![world.alice.clone()]);
    assert_eq!(
        world.notifier.sent().last().map(|(_, m)| m.level),
        Some(NotificationLevel::Reminder)
    );

    // 121 days: alerting, more urgent
    let report = world.service.poll(day(121)).unwrap();
    assert_eq!(report.statuses[0].state, LivenessState::Alerting);
    assert_eq!(
        world.notifier.sent().last().map(|(_, m)| m.level),
        Some(NotificationLevel::Urgent)
    );
    assert!(report.opened.is_empty());

    // 181 days: case opens and is verified by quorum + shards
    let verified = world.verify_by_silence();
    assert_eq!(verified.state, CaseState::Verified);

    // Next poll settles
    let report = world.service.poll(day(182)).unwrap();
    assert_eq!(report.advanced, vec![(verified.id.clone(), CaseState::Complete)]);
    assert_eq!(
        *world.registry.calls.lock().unwrap(),
        vec![
            "value_estate",
            "executor_auth",
            "fund_trust",
            "beneficiaries",
            "reparent_assets"
        ]
    );

    // Archived principals drop out of monitoring
    assert!(world.liveness.principal(&world.alice).unwrap().archived);
    let report = world.service.poll(day(400)).unwrap();
    assert!(report.statuses.is_empty());
    assert!(report.opened.is_empty());

    assert_eq!(
        world.transitions(),
        vec![
            "DEATH_SUSPECTED",
            "VERIFICATION_PENDING",
            "VERIFIED",
            "SETTLEMENT_IN_PROGRESS",
            "COMPLETE"
        ]
    );
    assert!(world.audit.verify_integrity().is_ok());
}

// ============================================================================
// 2. Resumed liveness
// ============================================================================

#[test]
fn test_check_in_aborts_case_and_stales_callbacks() {
    let world = World::new();
    let report = world.service.poll(day(181)).unwrap();
    let case = world.service.orchestrator().case(&report.opened[0]).unwrap();
    let old_epoch = case.epoch;

    world
        .service
        .verify_channel(&case.id, old_epoch, ChannelKind::Email, day(181))
        .unwrap();

    // Alice was alive after all
    let status = world.service.ping(&world.alice, day(182)).unwrap();
    assert_eq!(status.state, LivenessState::Active);

    let aborted = world.service.orchestrator().case(&case.id).unwrap();
    assert_eq!(aborted.state, CaseState::Aborted);
    assert!(aborted.epoch > old_epoch);
    assert!(aborted.abort_reason.is_some());

    // In-flight callbacks carrying the old epoch are refused
    let late_confirm =
        world
            .service
            .verify_channel(&case.id, old_epoch, ChannelKind::Sms, day(182));
    assert!(matches!(
        late_confirm,
        Err(SuccessionError::StaleTransition { .. })
    ));
    let late_shard = world
        .service
        .add_shard(&case.id, old_epoch, world.shards[0].clone(), day(182));
    assert!(matches!(
        late_shard,
        Err(SuccessionError::StaleTransition { .. })
    ));
    let late_advance = world.service.advance_case(&case.id, old_epoch, day(182));
    assert!(matches!(
        late_advance,
        Err(SuccessionError::StaleTransition { .. })
    ));

    // The clock restarts from the check-in
    let report = world.service.poll(day(182 + 179)).unwrap();
    assert!(report.opened.is_empty());
    let report = world.service.poll(day(182 + 180)).unwrap();
    assert_eq!(report.opened.len(), 1);
    assert_ne!(report.opened[0], case.id);

    assert_eq!(
        world.transitions(),
        vec![
            "DEATH_SUSPECTED",
            "VERIFICATION_PENDING",
            "ABORTED",
            "DEATH_SUSPECTED",
            "VERIFICATION_PENDING"
        ]
    );
}

#[test]
fn test_check_in_after_verification_does_not_abort() {
    let world = World::new();
    let verified = world.verify_by_silence();

    world.service.ping(&world.alice, day(181)).unwrap();
    let case = world.service.orchestrator().case(&verified.id).unwrap();
    assert_eq!(case.state, CaseState::Verified);
}

// ============================================================================
// 3. Forced liquidation
// ============================================================================

#[test]
fn test_deadlocked_step_is_force_liquidated() {
    let world = World::new();
    world
        .registry
        .executor_authorized
        .store(false, Ordering::SeqCst);
    let verified = world.verify_by_silence();

    // Settlement starts and blocks on executor authorization
    let report = world.service.poll(day(182)).unwrap();
    assert_eq!(
        report.advanced,
        vec![(verified.id.clone(), CaseState::SettlementInProgress)]
    );

    let status = world
        .service
        .get_case_status(&verified.id, day(182 + 89))
        .unwrap();
    let step = status
        .case
        .settlement
        .step(StepKind::ExecutorAuthorization)
        .unwrap();
    assert_eq!(step.status, StepStatus::InProgress);
    assert_eq!(step.blocked_since, Some(day(182)));
    assert!(step.last_error.is_some());
    assert!(status.liquidation.contains(&(
        StepKind::ExecutorAuthorization,
        LiquidationDecision::Waiting { days_remaining: 1 }
    )));

    // Still blocked the day before the deadline
    world.service.poll(day(182 + 89)).unwrap();
    assert!(world.registry.liquidated.lock().unwrap().is_empty());

    // Deadline reached: liquidate and move on. Reparenting blocks next.
    world
        .registry
        .beneficiaries_valid
        .store(false, Ordering::SeqCst);
    let report = world.service.poll(day(182 + 90)).unwrap();
    assert_eq!(
        report.advanced,
        vec![(verified.id.clone(), CaseState::SettlementInProgress)]
    );
    assert_eq!(
        *world.registry.liquidated.lock().unwrap(),
        vec![StepKind::ExecutorAuthorization]
    );

    let case = world.service.orchestrator().case(&verified.id).unwrap();
    let forced_step = case
        .settlement
        .step(StepKind::ExecutorAuthorization)
        .unwrap();
    assert_eq!(forced_step.status, StepStatus::ForceResolved);
    assert!(forced_step.resolution.is_some());
    assert_eq!(
        case.settlement.step(StepKind::TrustFunding).unwrap().status,
        StepStatus::Done
    );

    let forced: Vec<_> = world
        .audit
        .entries()
        .into_iter()
        .filter(|e| e.event() == Some("force_liquidation"))
        .collect();
    assert_eq!(forced.len(), 1);
    assert_eq!(forced[0].payload["step"], "executor_authorization");
    assert_eq!(forced[0].payload["blocked_days"], 90);

    // A force-resolved step cannot be completed by hand afterwards
    assert!(matches!(
        world.service.resolve_step(
            &case.id,
            case.epoch,
            StepKind::ExecutorAuthorization,
            day(300)
        ),
        Err(SuccessionError::DeadlockExceeded {
            step: StepKind::ExecutorAuthorization,
            blocked_days: 90
        })
    ));

    world
        .registry
        .beneficiaries_valid
        .store(true, Ordering::SeqCst);
    let report = world.service.poll(day(300)).unwrap();
    assert_eq!(report.advanced, vec![(verified.id.clone(), CaseState::Complete)]);
}

#[test]
fn test_blocked_step_can_be_resolved_by_hand() {
    let world = World::new();
    world
        .registry
        .beneficiaries_valid
        .store(false, Ordering::SeqCst);
    let verified = world.verify_by_silence();
    world.service.poll(day(182)).unwrap();

    let case = world.service.orchestrator().case(&verified.id).unwrap();
    assert_eq!(case.state, CaseState::SettlementInProgress);
    assert_eq!(
        case.settlement.next_unresolved().map(|i| case.settlement.steps[i].kind),
        Some(StepKind::AssetReparenting)
    );

    let done = world
        .service
        .resolve_step(&case.id, case.epoch, StepKind::AssetReparenting, day(190))
        .unwrap();
    assert_eq!(done.state, CaseState::Complete);
    assert!(world.liveness.principal(&world.alice).unwrap().archived);
    assert!(world.registry.liquidated.lock().unwrap().is_empty());
}

// ============================================================================
// 4. Collaborator timeout
// ============================================================================

#[test]
fn test_hanging_collaborator_times_out_then_retries() {
    let world = World::new();
    let verified = world.verify_by_silence();

    world.registry.slow.store(true, Ordering::SeqCst);
    let result = world
        .service
        .advance_case(&verified.id, verified.epoch, day(182));
    assert!(matches!(
        result,
        Err(SuccessionError::CollaboratorTimeout { .. })
    ));

    let case = world.service.orchestrator().case(&verified.id).unwrap();
    assert_eq!(case.state, CaseState::SettlementInProgress);
    assert_eq!(
        case.settlement.step(StepKind::Valuation).unwrap().status,
        StepStatus::FailedRetryable
    );

    world.registry.slow.store(false, Ordering::SeqCst);
    let done = world
        .service
        .advance_case(&case.id, case.epoch, day(183))
        .unwrap();
    assert_eq!(done.state, CaseState::Complete);
}

// ============================================================================
// 5. Death report
// ============================================================================

#[test]
fn test_death_report_opens_case_while_active() {
    let world = World::new();
    let event = DeathVerificationEvent {
        principal_id: world.alice.clone(),
        verified_by: "county-registrar".into(),
        timestamp: day(10),
    };

    let case = world.service.report_death(&event, day(10)).unwrap();
    assert_eq!(case.state, CaseState::VerificationPending);

    // A second report joins the same case
    let again = world.service.report_death(&event, day(11)).unwrap();
    assert_eq!(again.id, case.id);

    // Quorum alone is not enough without the shards
    for channel in [ChannelKind::Email, ChannelKind::Sms] {
        world
            .service
            .verify_channel(&case.id, case.epoch, channel, day(11))
            .unwrap();
    }
    assert!(matches!(
        world.service.advance_case(&case.id, case.epoch, day(11)),
        Err(SuccessionError::InsufficientShares { have: 0, need: 2 })
    ));

    // Nor are shards alone once the confirmations lapse
    for shard in &world.shards[..2] {
        world
            .service
            .add_shard(&case.id, case.epoch, shard.clone(), day(15))
            .unwrap();
    }
    assert!(matches!(
        world.service.advance_case(&case.id, case.epoch, day(15)),
        Err(SuccessionError::QuorumNotMet { verified: 0, required: 2 })
    ));

    for channel in [ChannelKind::Email, ChannelKind::Sms] {
        world
            .service
            .verify_channel(&case.id, case.epoch, channel, day(15))
            .unwrap();
    }
    let verified = world
        .service
        .advance_case(&case.id, case.epoch, day(15))
        .unwrap();
    assert_eq!(verified.state, CaseState::Verified);
}
