//! Succession orchestration.
//!
//! Drives each case through its state machine. The orchestrator owns case
//! state, verification state and the in-memory shard pool; liveness and
//! every external collaborator are only ever read.
//!
//! # Ordering
//!
//! Every transition is appended to the audit chain before the new state is
//! stored. If the append fails (for example because the chain is halted)
//! the transition does not happen.
//!
//! # Locking
//!
//! Writes are serialized per principal and per case. A principal lock may be
//! held while taking a case lock, never the other way round.
//!
//! Notifications raised under a lock are queued and only sent once the
//! public call has released it.

use crate::case::{CaseState, CaseTrigger, SuccessionCase, SuccessionEvent};
use crate::collaborators::{
    call_with_timeout, CollaboratorError, Collaborators, DeathVerificationEvent,
};
use crate::error::SuccessionError;
use crate::heartbeat::LivenessMonitor;
use crate::quorum::{QuorumError, QuorumState, QuorumStatus, QuorumVerifier, VerificationChannel};
use crate::settlement::{LiquidationDecision, LiquidationEnforcer, StepKind};
use chrono::{DateTime, Utc};
use deadhand_audit::AuditChain;
use deadhand_core::{
    CallBudget, CaseId, ChannelKind, KeyedLocks, MemoryRepository, Principal, PrincipalId,
    Repository,
};
use deadhand_notify::{templates, DispatchReport, NotificationMessage};
use deadhand_shamir::{SecretHandle, Shard};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use zeroize::Zeroizing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Upper bound on any single collaborator call
    pub collaborator_timeout: Duration,
    pub liquidation: LiquidationEnforcer,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            collaborator_timeout: Duration::from_secs(30),
            liquidation: LiquidationEnforcer::default(),
        }
    }
}

/// Persistence for everything the orchestrator owns.
#[derive(Clone)]
pub struct CaseStores {
    pub cases: Arc<dyn Repository<SuccessionCase>>,
    pub quorum: Arc<dyn Repository<QuorumState>>,
    /// Secret handles, keyed by principal id
    pub handles: Arc<dyn Repository<SecretHandle>>,
}

impl CaseStores {
    pub fn in_memory() -> Self {
        Self {
            cases: Arc::new(MemoryRepository::new()),
            quorum: Arc::new(MemoryRepository::new()),
            handles: Arc::new(MemoryRepository::new()),
        }
    }
}

/// Read-only snapshot of a case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseStatus {
    pub case: SuccessionCase,
    pub quorum: QuorumStatus,
    pub shards_collected: usize,
    /// Zero when no secret is registered
    pub shards_required: usize,
    /// Enforcer verdict for every settlement step
    pub liquidation: Vec<(StepKind, LiquidationDecision)>,
}

enum StepOutcome {
    Completed,
    Blocked(String),
}

pub struct SuccessionOrchestrator {
    liveness: Arc<LivenessMonitor>,
    quorum: QuorumVerifier,
    audit: Arc<AuditChain>,
    cases: Arc<dyn Repository<SuccessionCase>>,
    handles: Arc<dyn Repository<SecretHandle>>,
    collaborators: Collaborators,
    config: OrchestratorConfig,
    locks: KeyedLocks,
    /// Shards submitted for the current verification attempt. Never persisted.
    shards: Mutex<HashMap<CaseId, Vec<Shard>>>,
    /// Notifications waiting for the current lock holder to finish
    outbox: Mutex<Vec<(Vec<ChannelKind>, NotificationMessage)>>,
    workers: CallBudget,
}

fn principal_key(id: &PrincipalId) -> String {
    format!("principal/{}", id)
}

fn case_key(id: &CaseId) -> String {
    format!("case/{}", id)
}

impl SuccessionOrchestrator {
    pub fn new(
        liveness: Arc<LivenessMonitor>,
        audit: Arc<AuditChain>,
        stores: CaseStores,
        collaborators: Collaborators,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            liveness,
            quorum: QuorumVerifier::new(stores.quorum),
            audit,
            cases: stores.cases,
            handles: stores.handles,
            collaborators,
            config,
            locks: KeyedLocks::new(),
            shards: Mutex::new(HashMap::new()),
            outbox: Mutex::new(Vec::new()),
            workers: CallBudget::default(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn audit(&self) -> &AuditChain {
        &self.audit
    }

    /// Send a message now, each channel bounded by the collaborator timeout.
    /// Must not be called with a lock held.
    pub fn send_notice(&self, channels: &[ChannelKind], message: &NotificationMessage) -> DispatchReport {
        self.collaborators
            .notifications
            .dispatch_within(channels, message, self.config.collaborator_timeout)
    }

    /// Collaborator calls given up on that are still running.
    pub fn hung_calls(&self) -> usize {
        self.workers.abandoned()
    }

    // ========================================================================
    // Enrollment
    // ========================================================================

    /// Register the public handle of a principal's split secret. Refused
    /// while a case is in flight.
    pub fn register_secret(&self, principal_id: &PrincipalId, handle: &SecretHandle) -> Result<(), SuccessionError> {
        self.exclusive(&principal_key(principal_id), || {
            self.liveness.principal(principal_id)?;
            if let Some(case) = self.active_case(principal_id)? {
                return Err(SuccessionError::WrongState {
                    case_id: case.id,
                    state: case.state,
                    operation: "replace the registered secret",
                });
            }
            self.handles.save(principal_id.as_str(), handle)?;
            log::info!(
                "Registered {}-of-{} secret for {}",
                handle.threshold,
                handle.total,
                principal_id
            );
            Ok(())
        })
    }

    // ========================================================================
    // Opening and aborting
    // ========================================================================

    /// React to the principal's current liveness.
    ///
    /// Opens a case once succession is pending, and aborts a case that has
    /// not yet been verified if the principal has checked in since it opened.
    /// Returns the principal's current or just-closed case, if any.
    pub fn observe_liveness(&self, principal_id: &PrincipalId, now: DateTime<Utc>) -> Result<Option<SuccessionCase>, SuccessionError> {
        self.exclusive(&principal_key(principal_id), || {
            let principal = self.liveness.principal(principal_id)?;

            if let Some(case) = self.active_case(principal_id)? {
                if !case.state.is_pre_verified() {
                    return Ok(Some(case));
                }
                let case = self.locks.with_lock(&case_key(&case.id), || {
                    let mut case = self.load_case(&case.id)?;
                    self.abort_if_alive(&mut case, now)?;
                    Ok::<_, SuccessionError>(case)
                })?;
                return Ok(Some(case));
            }

            if principal.archived {
                return Ok(None);
            }

            let status = self.liveness.get_status(principal_id, now)?;
            if status.state == crate::heartbeat::LivenessState::SuccessionPending {
                let trigger = CaseTrigger::LivenessEscalation {
                    last_seen: status.last_seen,
                };
                return self.open_case(&principal, trigger, now).map(Some);
            }
            Ok(None)
        })
    }

    /// Open a case from an external death report. A report for a principal
    /// whose case is already open returns that case.
    pub fn on_death_verification(&self, event: &DeathVerificationEvent, now: DateTime<Utc>) -> Result<SuccessionCase, SuccessionError> {
        self.exclusive(&principal_key(&event.principal_id), || {
            let principal = self.liveness.principal(&event.principal_id)?;
            if principal.archived {
                log::warn!(
                    "Refused death report for archived principal {} from {}",
                    principal.id,
                    event.verified_by
                );
                return Err(SuccessionError::PrincipalArchived(principal.id));
            }
            self.record(
                &SuccessionEvent::DeathVerificationReceived {
                    principal_id: &principal.id,
                    verified_by: &event.verified_by,
                    reported_at: event.timestamp,
                },
                now,
            )?;

            if let Some(case) = self.active_case(&principal.id)? {
                log::info!("Death report for {} joins open case {}", principal.id, case.id);
                return Ok(case);
            }

            let trigger = CaseTrigger::DeathVerification {
                verified_by: event.verified_by.clone(),
                reported_at: event.timestamp,
            };
            self.open_case(&principal, trigger, now)
        })
    }

    fn open_case(&self, principal: &Principal, trigger: CaseTrigger, now: DateTime<Utc>) -> Result<SuccessionCase, SuccessionError> {
        let mut case = SuccessionCase::new(principal.id.clone(), trigger, now);
        let reason = match &case.trigger {
            CaseTrigger::LivenessEscalation { .. } => "liveness escalation".to_string(),
            CaseTrigger::DeathVerification { verified_by, .. } => {
                format!("death reported by {}", verified_by)
            }
        };

        self.locks.with_lock(&case_key(&case.id), || {
            self.apply_transition(&mut case, CaseState::DeathSuspected, now, &reason)?;
            self.begin_verification(&mut case, principal, now)
        })?;

        log::warn!("Opened succession case {} for {} ({})", case.id, principal.id, reason);
        Ok(case)
    }

    fn begin_verification(&self, case: &mut SuccessionCase, principal: &Principal, now: DateTime<Utc>) -> Result<(), SuccessionError> {
        self.apply_transition(case, CaseState::VerificationPending, now, "verification requested")?;
        self.quorum
            .open(&case.id, case.epoch, principal.quorum, &principal.channels)?;
        self.request_confirmations(principal, case, &principal.channels);
        Ok(())
    }

    /// Abort a not-yet-verified case if the principal has pinged at or
    /// after the time it opened.
    fn abort_if_alive(&self, case: &mut SuccessionCase, now: DateTime<Utc>) -> Result<bool, SuccessionError> {
        if !case.state.is_pre_verified() {
            return Ok(false);
        }
        let last_seen = match self.liveness.last_heartbeat(&case.principal_id)? {
            Some(last_seen) if last_seen >= case.opened_at => last_seen,
            _ => return Ok(false),
        };

        let reason = format!("principal checked in at {}", last_seen);
        case.abort_reason = Some(reason.clone());
        self.apply_transition(case, CaseState::Aborted, now, &reason)?;
        self.discard_shards(&case.id);
        log::warn!("Aborted case {}: {}", case.id, reason);
        self.notify_outcome(case);
        Ok(true)
    }

    // ========================================================================
    // Verification
    // ========================================================================

    /// Record one channel's confirmation for the case's current epoch.
    pub fn verify_channel(&self, case_id: &CaseId, epoch: u64, channel: ChannelKind, now: DateTime<Utc>) -> Result<VerificationChannel, SuccessionError> {
        self.exclusive(&case_key(case_id), || {
            let mut case = self.load_case(case_id)?;
            if self.abort_if_alive(&mut case, now)? {
                return Err(stale(&case, epoch));
            }
            case.check_epoch(epoch)?;
            case.require_state(CaseState::VerificationPending, "verify a channel")?;

            let state = self
                .quorum
                .state(case_id)?
                .ok_or_else(|| QuorumError::UnknownCase(case_id.clone()))?;
            if !state.channels.iter().any(|c| c.kind == channel) {
                return Err(QuorumError::UnknownChannel {
                    case_id: case_id.clone(),
                    channel,
                }
                .into());
            }

            self.record(
                &SuccessionEvent::ChannelVerified {
                    case_id,
                    epoch,
                    channel,
                    expires_at: Some(now + state.policy.verification_window),
                },
                now,
            )?;
            Ok(self.quorum.verify_channel(case_id, epoch, channel, now)?)
        })
    }

    /// Accept one custodian's shard. Shards are checked against the
    /// registered handle on arrival; resubmitting the same shard is a no-op.
    /// Returns the number of distinct shards held for the case.
    pub fn add_shard(&self, case_id: &CaseId, epoch: u64, shard: Shard, now: DateTime<Utc>) -> Result<usize, SuccessionError> {
        self.exclusive(&case_key(case_id), || {
            let mut case = self.load_case(case_id)?;
            if self.abort_if_alive(&mut case, now)? {
                return Err(stale(&case, epoch));
            }
            case.check_epoch(epoch)?;
            case.require_state(CaseState::VerificationPending, "accept shards")?;

            let handle = self.handle_for(&case.principal_id)?;
            handle.check_shard(&shard)?;

            if let Some(held) = self.shard_pool().get(case_id) {
                if held.iter().any(|s| s.index == shard.index) {
                    log::debug!("Shard {} already held for {}", shard.index, case_id);
                    return Ok(held.len());
                }
            }

            self.record(
                &SuccessionEvent::ShardAccepted {
                    case_id,
                    epoch,
                    index: shard.index,
                },
                now,
            )?;
            let mut pool = self.shard_pool();
            let held = pool.entry(case_id.clone()).or_default();
            held.push(shard);
            log::info!("Accepted shard for {} ({} of {})", case_id, held.len(), handle.threshold);
            Ok(held.len())
        })
    }

    // ========================================================================
    // Advancing
    // ========================================================================

    /// Take the next step a case is ready for.
    ///
    /// - `VerificationPending`: verify if the quorum is met *and* the shards
    ///   reconstruct the registered secret, both judged at this epoch.
    /// - `Verified`: start settlement.
    /// - `SettlementInProgress`: run settlement steps in order until one
    ///   blocks or all are resolved.
    ///
    /// Terminal cases are returned unchanged.
    pub fn advance_case(&self, case_id: &CaseId, epoch: u64, now: DateTime<Utc>) -> Result<SuccessionCase, SuccessionError> {
        self.exclusive(&case_key(case_id), || {
            self.audit.ensure_intact()?;

            let mut case = self.load_case(case_id)?;
            if self.abort_if_alive(&mut case, now)? {
                return Err(stale(&case, epoch));
            }
            case.check_epoch(epoch)?;

            match case.state {
                CaseState::DeathSuspected => {
                    // Opening was interrupted before verification began
                    let principal = self.liveness.principal(&case.principal_id)?;
                    self.begin_verification(&mut case, &principal, now)?;
                }
                CaseState::VerificationPending => self.verify_gates(&mut case, now)?,
                CaseState::Verified => {
                    self.apply_transition(&mut case, CaseState::SettlementInProgress, now, "settlement started")?;
                    self.run_settlement(&mut case, now)?;
                }
                CaseState::SettlementInProgress => self.run_settlement(&mut case, now)?,
                CaseState::Monitoring | CaseState::Complete | CaseState::Aborted => {}
            }
            Ok(case)
        })
    }

    fn verify_gates(&self, case: &mut SuccessionCase, now: DateTime<Utc>) -> Result<(), SuccessionError> {
        let principal = self.liveness.principal(&case.principal_id)?;
        let quorum = match self.quorum.state(&case.id)? {
            Some(state) if state.epoch == case.epoch => state.status(now),
            _ => QuorumStatus {
                epoch: case.epoch,
                required: principal.quorum.minimum,
                ..QuorumStatus::default()
            },
        };

        // Both gates are evaluated every time, against the same epoch
        let handle = self.handle_for(&case.principal_id)?;
        let shards: Vec<Shard> = self.shard_pool().get(&case.id).cloned().unwrap_or_default();
        let reconstruction = deadhand_shamir::reconstruct(&handle, &shards).map(Zeroizing::new);
        drop(shards);

        if !quorum.met {
            let reason = format!("quorum {} of {}", quorum.verified, quorum.required);
            self.record(
                &SuccessionEvent::VerificationRejected {
                    case_id: &case.id,
                    epoch: case.epoch,
                    reason: &reason,
                },
                now,
            )?;
            return Err(SuccessionError::QuorumNotMet {
                verified: quorum.verified,
                required: quorum.required,
            });
        }
        if let Err(e) = reconstruction {
            let reason = e.to_string();
            self.record(
                &SuccessionEvent::VerificationRejected {
                    case_id: &case.id,
                    epoch: case.epoch,
                    reason: &reason,
                },
                now,
            )?;
            return Err(e.into());
        }

        self.apply_transition(case, CaseState::Verified, now, "quorum met and secret reconstructed")?;
        self.discard_shards(&case.id);
        Ok(())
    }

    fn run_settlement(&self, case: &mut SuccessionCase, now: DateTime<Utc>) -> Result<(), SuccessionError> {
        let principal = self.liveness.principal(&case.principal_id)?;

        while let Some(index) = case.settlement.next_unresolved() {
            let kind = case.settlement.steps[index].kind;
            let mut updated = case.clone();
            updated.settlement.steps[index].begin();

            let mut failure = None;
            match self.execute_step(&principal, &case.id, kind) {
                Ok(StepOutcome::Completed) => {
                    updated.settlement.mark_done(kind, now)?;
                    self.record(
                        &SuccessionEvent::StepCompleted {
                            case_id: &case.id,
                            step: kind,
                            attempts: updated.settlement.steps[index].attempts,
                        },
                        now,
                    )?;
                    self.cases.save(case.id.as_str(), &updated)?;
                    log::info!("Case {}: {} done", case.id, kind);
                    *case = updated;
                    continue;
                }
                Ok(StepOutcome::Blocked(reason)) => {
                    self.record_step_failure(&case.id, kind, &reason, now)?;
                    updated.settlement.steps[index].block(now, reason);
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.record_step_failure(&case.id, kind, &reason, now)?;
                    updated.settlement.steps[index].fail_retryable(now, reason);
                    failure = Some(e);
                }
            }

            match self.config.liquidation.check(&updated.settlement.steps[index], now) {
                LiquidationDecision::ForceLiquidation { blocked_days } => {
                    match self.liquidate(&principal, &case.id, kind) {
                        Ok(action) => {
                            self.record(
                                &SuccessionEvent::ForceLiquidation {
                                    case_id: &case.id,
                                    step: kind,
                                    blocked_days,
                                    action: &action,
                                },
                                now,
                            )?;
                            log::warn!(
                                "Case {}: {} blocked {} days, forced liquidation: {}",
                                case.id,
                                kind,
                                blocked_days,
                                action
                            );
                            updated.settlement.steps[index].force_resolve(now, action);
                            self.cases.save(case.id.as_str(), &updated)?;
                            *case = updated;
                            continue;
                        }
                        Err(e) => {
                            log::error!("Case {}: liquidation of {} failed: {}", case.id, kind, e);
                            updated.settlement.steps[index].last_error =
                                Some(format!("liquidation failed: {}", e));
                            failure = Some(e);
                        }
                    }
                }
                LiquidationDecision::Waiting { days_remaining } => {
                    log::info!(
                        "Case {}: {} blocked, {} days until forced liquidation",
                        case.id,
                        kind,
                        days_remaining
                    );
                }
                LiquidationDecision::Clear => {}
            }

            self.cases.save(case.id.as_str(), &updated)?;
            *case = updated;
            return match failure {
                Some(e) => Err(e.into()),
                None => Ok(()),
            };
        }

        self.apply_transition(case, CaseState::Complete, now, "settlement finished")?;
        self.notify_outcome(case);
        Ok(())
    }

    fn record_step_failure(&self, case_id: &CaseId, step: StepKind, reason: &str, now: DateTime<Utc>) -> Result<(), SuccessionError> {
        log::warn!("Case {}: {} did not complete: {}", case_id, step, reason);
        self.record(&SuccessionEvent::StepFailed { case_id, step, reason }, now)
    }

    fn execute_step(&self, principal: &Principal, case_id: &CaseId, kind: StepKind) -> Result<StepOutcome, CollaboratorError> {
        let timeout = self.config.collaborator_timeout;
        let principal_id = principal.id.clone();
        let case_id = case_id.clone();

        match kind {
            StepKind::Valuation => {
                let estate = self.collaborators.estate.clone();
                call_with_timeout(&self.workers, "estate_valuation", timeout, move || {
                    estate.value_estate(&principal_id, &case_id)
                })?;
                Ok(StepOutcome::Completed)
            }
            StepKind::ExecutorAuthorization => {
                let Some(designation) = principal.executor.clone() else {
                    return Ok(StepOutcome::Blocked("no executor designated".into()));
                };
                let auth = self.collaborators.executor_auth.clone();
                let (executor_id, doc_id) =
                    (designation.executor_id.clone(), designation.doc_id.clone());
                let authorization = call_with_timeout(&self.workers, "executor_auth", timeout, move || {
                    auth.verify_authorization(&executor_id, &doc_id)
                })?;
                if authorization.authorized {
                    Ok(StepOutcome::Completed)
                } else {
                    Ok(StepOutcome::Blocked(format!(
                        "executor {} not authorized under {}",
                        designation.executor_id, designation.doc_id
                    )))
                }
            }
            StepKind::TrustFunding => {
                let estate = self.collaborators.estate.clone();
                call_with_timeout(&self.workers, "trust_funding", timeout, move || {
                    estate.fund_trust(&principal_id, &case_id)
                })?;
                Ok(StepOutcome::Completed)
            }
            StepKind::AssetReparenting => {
                let tree = self.collaborators.beneficiaries.clone();
                let owner = principal_id.clone();
                let valid = call_with_timeout(&self.workers, "beneficiary_tree", timeout, move || tree.validate(&owner))?;
                if !valid {
                    return Ok(StepOutcome::Blocked(
                        "beneficiary allocation failed validation".into(),
                    ));
                }
                let estate = self.collaborators.estate.clone();
                call_with_timeout(&self.workers, "asset_reparenting", timeout, move || {
                    estate.reparent_assets(&principal_id, &case_id)
                })?;
                Ok(StepOutcome::Completed)
            }
        }
    }

    fn liquidate(&self, principal: &Principal, case_id: &CaseId, step: StepKind) -> Result<String, CollaboratorError> {
        let estate = self.collaborators.estate.clone();
        let principal_id = principal.id.clone();
        let case_id = case_id.clone();
        call_with_timeout(&self.workers, "estate_liquidation", self.config.collaborator_timeout, move || {
            estate.liquidate(&principal_id, &case_id, step)
        })
    }

    /// Complete a settlement step out of band (e.g. an executor finished it
    /// by hand). Earlier steps must already be resolved.
    pub fn resolve_step(&self, case_id: &CaseId, epoch: u64, step: StepKind, now: DateTime<Utc>) -> Result<SuccessionCase, SuccessionError> {
        self.exclusive(&case_key(case_id), || {
            let mut case = self.load_case(case_id)?;
            case.check_epoch(epoch)?;
            case.require_state(CaseState::SettlementInProgress, "resolve a settlement step")?;

            let mut updated = case.clone();
            updated.settlement.mark_done(step, now)?;
            let attempts = updated
                .settlement
                .step(step)
                .map(|s| s.attempts)
                .unwrap_or_default();
            self.record(
                &SuccessionEvent::StepCompleted {
                    case_id,
                    step,
                    attempts,
                },
                now,
            )?;
            self.cases.save(case_id.as_str(), &updated)?;
            case = updated;

            if case.settlement.is_complete() {
                self.apply_transition(&mut case, CaseState::Complete, now, "settlement finished")?;
                self.notify_outcome(&case);
            }
            Ok(case)
        })
    }

    // ========================================================================
    // Queries and sweeps
    // ========================================================================

    pub fn case(&self, case_id: &CaseId) -> Result<SuccessionCase, SuccessionError> {
        self.load_case(case_id)
    }

    pub fn get_case_status(&self, case_id: &CaseId, now: DateTime<Utc>) -> Result<CaseStatus, SuccessionError> {
        let case = self.load_case(case_id)?;
        let quorum = match self.quorum.status(case_id, now) {
            status if status.epoch == case.epoch => status,
            _ => QuorumStatus::default(),
        };
        let shards_collected = self.shard_pool().get(case_id).map(Vec::len).unwrap_or(0);
        let shards_required = match self.handles.load(case.principal_id.as_str()) {
            Ok(Some(handle)) => handle.threshold as usize,
            Ok(None) => 0,
            Err(e) => {
                log::warn!("Could not load secret handle for {}: {}", case.principal_id, e);
                0
            }
        };
        let liquidation = case
            .settlement
            .steps
            .iter()
            .map(|s| (s.kind, self.config.liquidation.check(s, now)))
            .collect();

        Ok(CaseStatus {
            case,
            quorum,
            shards_collected,
            shards_required,
            liquidation,
        })
    }

    pub fn active_cases(&self) -> Result<Vec<SuccessionCase>, SuccessionError> {
        let mut active = Vec::new();
        for id in self.cases.ids()? {
            if let Some(case) = self.cases.load(&id)? {
                if case.is_active() {
                    active.push(case);
                }
            }
        }
        Ok(active)
    }

    pub fn active_case(&self, principal_id: &PrincipalId) -> Result<Option<SuccessionCase>, SuccessionError> {
        Ok(self
            .active_cases()?
            .into_iter()
            .find(|c| &c.principal_id == principal_id))
    }

    /// Clear lapsed confirmations on every case awaiting verification and
    /// ask those channels again.
    pub fn sweep_verifications(&self, now: DateTime<Utc>) -> Result<Vec<(CaseId, ChannelKind)>, SuccessionError> {
        let mut reconfirm = Vec::new();
        for case in self.active_cases()? {
            if case.state != CaseState::VerificationPending {
                continue;
            }
            let lapsed = self.quorum.sweep_expired(&case.id, now)?;
            if lapsed.is_empty() {
                continue;
            }
            let principal = self.liveness.principal(&case.principal_id)?;
            self.request_confirmations(&principal, &case, &lapsed);
            reconfirm.extend(lapsed.into_iter().map(|kind| (case.id.clone(), kind)));
        }
        self.flush_notifications();
        Ok(reconfirm)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn apply_transition(&self, case: &mut SuccessionCase, next: CaseState, now: DateTime<Utc>, reason: &str) -> Result<(), SuccessionError> {
        let mut updated = case.clone();
        let from = updated.transition(next, now)?;
        self.record(
            &SuccessionEvent::CaseTransition {
                case_id: &updated.id,
                principal_id: &updated.principal_id,
                from,
                to: next,
                epoch: updated.epoch,
                reason,
            },
            now,
        )?;
        self.cases.save(updated.id.as_str(), &updated)?;
        log::info!("Case {}: {:?} -> {:?} ({})", updated.id, from, next, reason);
        *case = updated;
        Ok(())
    }

    fn record(&self, event: &SuccessionEvent<'_>, now: DateTime<Utc>) -> Result<(), SuccessionError> {
        self.audit.append_at(event, now)?;
        Ok(())
    }

    fn load_case(&self, case_id: &CaseId) -> Result<SuccessionCase, SuccessionError> {
        self.cases
            .load(case_id.as_str())?
            .ok_or_else(|| SuccessionError::UnknownCase(case_id.clone()))
    }

    fn handle_for(&self, principal_id: &PrincipalId) -> Result<SecretHandle, SuccessionError> {
        self.handles
            .load(principal_id.as_str())?
            .ok_or_else(|| SuccessionError::MissingSecretHandle(principal_id.clone()))
    }

    fn shard_pool(&self) -> MutexGuard<'_, HashMap<CaseId, Vec<Shard>>> {
        self.shards.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn discard_shards(&self, case_id: &CaseId) {
        // Shards zeroize on drop
        self.shard_pool().remove(case_id);
    }

    /// Run `f` under the lock for `key`, then send whatever it queued.
    fn exclusive<R>(&self, key: &str, f: impl FnOnce() -> R) -> R {
        let result = self.locks.with_lock(key, f);
        self.flush_notifications();
        result
    }

    fn queue_notification(&self, channels: Vec<ChannelKind>, message: NotificationMessage) {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((channels, message));
    }

    fn flush_notifications(&self) {
        let pending = std::mem::take(&mut *self.outbox.lock().unwrap_or_else(PoisonError::into_inner));
        for (channels, message) in pending {
            self.send_notice(&channels, &message);
        }
    }

    fn request_confirmations(&self, principal: &Principal, case: &SuccessionCase, channels: &[ChannelKind]) {
        let window_hours = principal.quorum.verification_window.num_hours();
        for &channel in channels {
            let message = templates::confirmation_request(
                principal.id.as_str(),
                case.id.as_str(),
                channel.as_str(),
                window_hours,
            );
            self.queue_notification(vec![channel], message);
        }
    }

    fn notify_outcome(&self, case: &SuccessionCase) {
        match self.liveness.principal(&case.principal_id) {
            Ok(principal) => {
                let message = templates::case_notice(
                    principal.id.as_str(),
                    case.id.as_str(),
                    case.state.as_str(),
                );
                self.queue_notification(principal.channels.clone(), message);
            }
            Err(e) => log::warn!("No notice sent for {}: {}", case.id, e),
        }
    }
}

fn stale(case: &SuccessionCase, actual: u64) -> SuccessionError {
    SuccessionError::StaleTransition {
        case_id: case.id.clone(),
        expected: case.epoch,
        actual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::StepStatus;
    use crate::test_utils::{days, Harness};
    use chrono::Duration as Span;

    fn verified_harness() -> (Harness, SuccessionCase) {
        let h = Harness::new();
        let case = h.open_by_silence();
        h.confirm_all(&case);
        h.submit_shards(&case, 2);
        let case = h.advance(&case).unwrap();
        assert_eq!(case.state, CaseState::Verified);
        (h, case)
    }

    #[test]
    fn test_case_opens_after_succession_threshold() {
        let h = Harness::new();
        assert!(h
            .orchestrator()
            .observe_liveness(&h.alice, h.at(179))
            .unwrap()
            .is_none());

        let case = h
            .orchestrator()
            .observe_liveness(&h.alice, h.at(181))
            .unwrap()
            .unwrap();
        assert_eq!(case.state, CaseState::VerificationPending);
        assert_eq!(case.epoch, 1);

        // Confirmation requests went out on both channels
        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].1.body.contains(case.id.as_str()));
    }

    #[test]
    fn test_observe_is_idempotent() {
        let h = Harness::new();
        let first = h.open_by_silence();
        let again = h
            .orchestrator()
            .observe_liveness(&h.alice, h.at(182))
            .unwrap()
            .unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(h.orchestrator().active_cases().unwrap().len(), 1);
    }

    #[test]
    fn test_quorum_without_shards_stays_pending() {
        let h = Harness::new();
        let case = h.open_by_silence();
        h.confirm_all(&case);

        let err = h.advance(&case).unwrap_err();
        assert!(matches!(
            err,
            SuccessionError::InsufficientShares { have: 0, need: 2 }
        ));
        assert_eq!(
            h.orchestrator().case(&case.id).unwrap().state,
            CaseState::VerificationPending
        );
    }

    #[test]
    fn test_shards_without_quorum_stay_pending() {
        let h = Harness::new();
        let case = h.open_by_silence();
        h.submit_shards(&case, 2);
        h.orchestrator()
            .verify_channel(&case.id, case.epoch, ChannelKind::Email, h.at(181))
            .unwrap();

        let err = h.advance(&case).unwrap_err();
        assert!(matches!(
            err,
            SuccessionError::QuorumNotMet {
                verified: 1,
                required: 2,
            }
        ));
    }

    #[test]
    fn test_quorum_met_but_inconsistent_shards_stay_pending() {
        let h = Harness::new();
        let case = h.open_by_silence();
        h.confirm_all(&case);

        // A shard from a different split with the same secret is rejected on arrival
        let (_, foreign) = deadhand_shamir::split(b"master-seed", 3, 2).unwrap();
        let err = h
            .orchestrator()
            .add_shard(&case.id, case.epoch, foreign[0].clone(), h.at(181))
            .unwrap_err();
        assert!(matches!(err, SuccessionError::InvalidShare(_)));

        // A tampered shard from the right split is rejected too
        let mut tampered = h.shards[0].clone();
        tampered.value[0] ^= 0xff;
        assert!(matches!(
            h.orchestrator()
                .add_shard(&case.id, case.epoch, tampered, h.at(181)),
            Err(SuccessionError::InvalidShare(_))
        ));

        h.submit_shards(&case, 1);
        assert!(h.advance(&case).is_err());
        assert_eq!(
            h.orchestrator().case(&case.id).unwrap().state,
            CaseState::VerificationPending
        );
    }

    #[test]
    fn test_expired_confirmation_blocks_verification() {
        let h = Harness::new();
        let case = h.open_by_silence();
        h.confirm_all(&case);
        h.submit_shards(&case, 2);

        let late = h.at(181) + Span::hours(73);
        let err = h
            .orchestrator()
            .advance_case(&case.id, case.epoch, late)
            .unwrap_err();
        assert!(matches!(err, SuccessionError::QuorumNotMet { verified: 0, .. }));
    }

    #[test]
    fn test_duplicate_shard_is_noop() {
        let h = Harness::new();
        let case = h.open_by_silence();
        let o = h.orchestrator();
        assert_eq!(o.add_shard(&case.id, case.epoch, h.shards[0].clone(), h.at(181)).unwrap(), 1);
        assert_eq!(o.add_shard(&case.id, case.epoch, h.shards[0].clone(), h.at(181)).unwrap(), 1);
        assert_eq!(o.get_case_status(&case.id, h.at(181)).unwrap().shards_collected, 1);
    }

    #[test]
    fn test_ping_aborts_pending_case() {
        let h = Harness::new();
        let case = h.open_by_silence();
        h.orchestrator()
            .verify_channel(&case.id, case.epoch, ChannelKind::Email, h.at(181))
            .unwrap();
        h.submit_shards(&case, 1);

        h.liveness.ping(&h.alice, h.at(182)).unwrap();
        let aborted = h
            .orchestrator()
            .observe_liveness(&h.alice, h.at(182))
            .unwrap()
            .unwrap();
        assert_eq!(aborted.state, CaseState::Aborted);
        assert_eq!(aborted.epoch, 2);
        assert!(aborted.abort_reason.is_some());
        assert_eq!(
            h.orchestrator()
                .get_case_status(&case.id, h.at(182))
                .unwrap()
                .shards_collected,
            0
        );
    }

    #[test]
    fn test_late_request_after_abort_is_stale() {
        let h = Harness::new();
        let case = h.open_by_silence();
        h.liveness.ping(&h.alice, h.at(182)).unwrap();

        // The abort is noticed by the request itself
        let err = h
            .orchestrator()
            .verify_channel(&case.id, case.epoch, ChannelKind::Sms, h.at(182))
            .unwrap_err();
        assert!(matches!(
            err,
            SuccessionError::StaleTransition {
                expected: 2,
                actual: 1,
                ..
            }
        ));

        let err = h
            .orchestrator()
            .add_shard(&case.id, case.epoch, h.shards[0].clone(), h.at(183))
            .unwrap_err();
        assert!(matches!(err, SuccessionError::StaleTransition { .. }));
        assert_eq!(
            h.orchestrator().case(&case.id).unwrap().state,
            CaseState::Aborted
        );
    }

    #[test]
    fn test_ping_after_verification_does_not_abort() {
        let (h, case) = verified_harness();
        h.liveness.ping(&h.alice, h.at(182)).unwrap();
        let current = h
            .orchestrator()
            .observe_liveness(&h.alice, h.at(182))
            .unwrap()
            .unwrap();
        assert_eq!(current.id, case.id);
        assert_eq!(current.state, CaseState::Verified);
    }

    #[test]
    fn test_settlement_runs_to_completion() {
        let (h, case) = verified_harness();
        let done = h.advance(&case).unwrap();
        assert_eq!(done.state, CaseState::Complete);
        assert!(done.settlement.steps.iter().all(|s| s.status == StepStatus::Done));
        assert_eq!(h.estate.calls(), vec!["value", "fund", "reparent"]);
    }

    #[test]
    fn test_blocked_step_waits_then_liquidates() {
        let (h, case) = verified_harness();
        h.executor.set_authorized(false);

        let o = h.orchestrator();
        let case = o.advance_case(&case.id, case.epoch, h.at(181)).unwrap();
        assert_eq!(case.state, CaseState::SettlementInProgress);

        let status = o.get_case_status(&case.id, h.at(181) + days(89)).unwrap();
        assert_eq!(
            status.liquidation[1],
            (
                StepKind::ExecutorAuthorization,
                LiquidationDecision::Waiting { days_remaining: 1 }
            )
        );

        let retried = o
            .advance_case(&case.id, case.epoch, h.at(181) + days(89))
            .unwrap();
        assert_eq!(retried.state, CaseState::SettlementInProgress);
        assert_eq!(retried.settlement.steps[2].status, StepStatus::Pending);

        let done = o
            .advance_case(&case.id, case.epoch, h.at(181) + days(91))
            .unwrap();
        assert_eq!(done.state, CaseState::Complete);
        assert_eq!(done.settlement.steps[1].status, StepStatus::ForceResolved);
        assert!(h
            .audit
            .entries()
            .iter()
            .any(|e| e.event() == Some("force_liquidation") && e.payload["blocked_days"] == 91));
    }

    #[test]
    fn test_collaborator_timeout_is_retryable() {
        let (h, case) = verified_harness();
        h.estate.set_slow(true);

        let err = h.advance(&case).unwrap_err();
        assert!(matches!(err, SuccessionError::CollaboratorTimeout { .. }));
        let stored = h.orchestrator().case(&case.id).unwrap();
        assert_eq!(stored.state, CaseState::SettlementInProgress);
        assert_eq!(stored.settlement.steps[0].status, StepStatus::FailedRetryable);

        h.estate.set_slow(false);
        let done = h.advance(&stored).unwrap();
        assert_eq!(done.state, CaseState::Complete);
        assert_eq!(done.settlement.steps[0].attempts, 2);
    }

    #[test]
    fn test_invalid_beneficiaries_block_reparenting() {
        let (h, case) = verified_harness();
        h.beneficiaries.set_valid(false);

        let case = h.advance(&case).unwrap();
        assert_eq!(case.state, CaseState::SettlementInProgress);
        let step = case.settlement.step(StepKind::AssetReparenting).unwrap();
        assert_eq!(step.status, StepStatus::InProgress);
        assert_eq!(step.blocked_since, Some(h.at(181)));
        assert!(!h.estate.calls().contains(&"reparent"));
    }

    #[test]
    fn test_resolve_step_enforces_order() {
        let (h, case) = verified_harness();
        h.executor.set_authorized(false);
        let case = h.advance(&case).unwrap();

        let o = h.orchestrator();
        let err = o
            .resolve_step(&case.id, case.epoch, StepKind::TrustFunding, h.at(190))
            .unwrap_err();
        assert!(matches!(
            err,
            SuccessionError::OutOfOrder {
                waiting_on: StepKind::ExecutorAuthorization,
                ..
            }
        ));

        o.resolve_step(&case.id, case.epoch, StepKind::ExecutorAuthorization, h.at(190))
            .unwrap();
        h.executor.set_authorized(true);
        let done = o.advance_case(&case.id, case.epoch, h.at(191)).unwrap();
        assert_eq!(done.state, CaseState::Complete);
    }

    #[test]
    fn test_death_verification_opens_case() {
        let h = Harness::new();
        let event = DeathVerificationEvent {
            principal_id: h.alice.clone(),
            verified_by: "county-registrar".into(),
            timestamp: h.at(10),
        };
        let case = h.orchestrator().on_death_verification(&event, h.at(10)).unwrap();
        assert_eq!(case.state, CaseState::VerificationPending);
        assert!(matches!(case.trigger, CaseTrigger::DeathVerification { .. }));

        // A second report joins the open case
        let again = h.orchestrator().on_death_verification(&event, h.at(11)).unwrap();
        assert_eq!(again.id, case.id);
    }

    #[test]
    fn test_every_transition_is_audited() {
        let (h, case) = verified_harness();
        h.advance(&case).unwrap();

        let transitions: Vec<String> = h
            .audit
            .entries()
            .iter()
            .filter(|e| e.event() == Some("case_transition"))
            .map(|e| e.payload["to"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(
            transitions,
            vec![
                "DEATH_SUSPECTED",
                "VERIFICATION_PENDING",
                "VERIFIED",
                "SETTLEMENT_IN_PROGRESS",
                "COMPLETE"
            ]
        );
        assert!(h.audit.verify_integrity().is_ok());
    }

    #[test]
    fn test_halted_audit_blocks_advance() {
        let h = Harness::new();
        let case = h.open_by_silence();
        h.confirm_all(&case);
        h.submit_shards(&case, 2);

        let mut entries = h.audit.entries();
        entries[0].payload = serde_json::json!({"event": "forged"});
        let broken = Arc::new(AuditChain::restore(entries));
        let h = h.with_audit(broken);

        let err = h.advance(&case).unwrap_err();
        assert!(matches!(
            err,
            SuccessionError::AuditIntegrityViolation { sequence: 1 }
        ));
        assert_eq!(
            h.orchestrator().case(&case.id).unwrap().state,
            CaseState::VerificationPending
        );
    }

    #[test]
    fn test_register_secret_refused_during_case() {
        let h = Harness::new();
        let _case = h.open_by_silence();
        let (handle, _) = deadhand_shamir::split(b"other", 3, 2).unwrap();
        assert!(matches!(
            h.orchestrator().register_secret(&h.alice, &handle),
            Err(SuccessionError::WrongState { .. })
        ));
    }

    #[test]
    fn test_sweep_requests_reconfirmation() {
        let h = Harness::new();
        let case = h.open_by_silence();
        h.orchestrator()
            .verify_channel(&case.id, case.epoch, ChannelKind::Email, h.at(181))
            .unwrap();
        let before = h.notifier.sent().len();

        let lapsed = h
            .orchestrator()
            .sweep_verifications(h.at(181) + Span::hours(80))
            .unwrap();
        assert_eq!(lapsed, vec![(case.id.clone(), ChannelKind::Email)]);
        assert_eq!(h.notifier.sent().len(), before + 1);
    }

    #[test]
    fn test_hanging_notifier_does_not_stall_case_opening() {
        let h = Harness::new();
        h.notifier.set_hanging(true);
        let event = DeathVerificationEvent {
            principal_id: h.alice.clone(),
            verified_by: "county-registrar".into(),
            timestamp: h.at(10),
        };

        // Each channel gives up after the 100ms collaborator timeout
        let started = std::time::Instant::now();
        let case = h.orchestrator().on_death_verification(&event, h.at(10)).unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
        assert_eq!(case.state, CaseState::VerificationPending);

        // The principal and case are free again straight away
        let started = std::time::Instant::now();
        h.orchestrator()
            .verify_channel(&case.id, case.epoch, ChannelKind::Email, h.at(10))
            .unwrap();
        let status = h.service.ping(&h.alice, h.at(11)).unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
        assert_eq!(status.state, crate::heartbeat::LivenessState::Active);
        assert_eq!(
            h.orchestrator().case(&case.id).unwrap().state,
            CaseState::Aborted
        );
    }

    #[test]
    fn test_confirmation_requests_sent_after_opening() {
        let h = Harness::new();
        let case = h.open_by_silence();

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(_, m)| m.body.contains(case.id.as_str())));
        assert!(h.orchestrator().outbox.lock().unwrap().is_empty());
    }

    #[test]
    fn test_death_report_for_archived_principal_leaves_no_entry() {
        let h = Harness::new();
        h.liveness.archive(&h.alice).unwrap();
        let before = h.audit.len();

        let event = DeathVerificationEvent {
            principal_id: h.alice.clone(),
            verified_by: "county-registrar".into(),
            timestamp: h.at(10),
        };
        assert!(matches!(
            h.orchestrator().on_death_verification(&event, h.at(10)),
            Err(SuccessionError::PrincipalArchived(_))
        ));
        assert_eq!(h.audit.len(), before);
        assert!(h.orchestrator().active_cases().unwrap().is_empty());
    }

    #[test]
    fn test_case_status_survives_quorum_store_failure() {
        let h = Harness::new();
        let case = h.open_by_silence();
        h.orchestrator()
            .verify_channel(&case.id, case.epoch, ChannelKind::Email, h.at(181))
            .unwrap();
        assert_eq!(
            h.orchestrator()
                .get_case_status(&case.id, h.at(181))
                .unwrap()
                .quorum
                .verified,
            1
        );

        h.quorum_store.set_failing(true);
        let status = h.orchestrator().get_case_status(&case.id, h.at(181)).unwrap();
        assert_eq!(status.case.state, CaseState::VerificationPending);
        assert_eq!(status.quorum.verified, 0);
        assert!(!status.quorum.met);
    }
}
