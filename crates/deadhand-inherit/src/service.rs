//! Public entry points.
//!
//! `SuccessionService` pairs the liveness monitor with the orchestrator so
//! that a ping is immediately reflected in any open case, and runs the
//! periodic poll that the daemon drives.

use crate::case::{CaseState, SuccessionCase};
use crate::collaborators::DeathVerificationEvent;
use crate::error::SuccessionError;
use crate::heartbeat::{LivenessMonitor, LivenessState, LivenessStatus};
use crate::orchestrator::{CaseStatus, SuccessionOrchestrator};
use crate::quorum::VerificationChannel;
use crate::settlement::StepKind;
use chrono::{DateTime, Utc};
use deadhand_core::{CaseId, ChannelKind, Principal, PrincipalId};
use deadhand_notify::templates;
use deadhand_shamir::{SecretHandle, Shard};
use std::sync::Arc;

/// What one poll did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Every non-archived principal, most urgent first
    pub statuses: Vec<LivenessStatus>,
    pub reminded: Vec<PrincipalId>,
    pub opened: Vec<CaseId>,
    pub aborted: Vec<CaseId>,
    /// Channels asked to confirm again after their window lapsed
    pub reconfirm: Vec<(CaseId, ChannelKind)>,
    /// Cases moved forward, with the state they ended in
    pub advanced: Vec<(CaseId, CaseState)>,
    /// Per-item failures; the poll itself carries on
    pub errors: Vec<String>,
}

pub struct SuccessionService {
    liveness: Arc<LivenessMonitor>,
    orchestrator: SuccessionOrchestrator,
}

impl SuccessionService {
    pub fn new(liveness: Arc<LivenessMonitor>, orchestrator: SuccessionOrchestrator) -> Self {
        Self {
            liveness,
            orchestrator,
        }
    }

    pub fn liveness(&self) -> &LivenessMonitor {
        &self.liveness
    }

    pub fn orchestrator(&self) -> &SuccessionOrchestrator {
        &self.orchestrator
    }

    /// Enroll a principal together with the handle of their split secret.
    pub fn enroll(&self, principal: Principal, handle: &SecretHandle) -> Result<(), SuccessionError> {
        let id = principal.id.clone();
        self.liveness.enroll(principal)?;
        self.orchestrator.register_secret(&id, handle)
    }

    /// Record a check-in. Aborts any case that has not been verified yet.
    pub fn ping(&self, principal_id: &PrincipalId, at: DateTime<Utc>) -> Result<LivenessStatus, SuccessionError> {
        self.liveness.ping(principal_id, at)?;
        if let Some(case) = self.orchestrator.observe_liveness(principal_id, at)? {
            if case.state == CaseState::Aborted {
                log::info!("Check-in from {} aborted case {}", principal_id, case.id);
            }
        }
        Ok(self.liveness.get_status(principal_id, at)?)
    }

    pub fn get_status(&self, principal_id: &PrincipalId, now: DateTime<Utc>) -> Result<LivenessStatus, SuccessionError> {
        Ok(self.liveness.get_status(principal_id, now)?)
    }

    pub fn report_death(&self, event: &DeathVerificationEvent, now: DateTime<Utc>) -> Result<SuccessionCase, SuccessionError> {
        self.orchestrator.on_death_verification(event, now)
    }

    pub fn verify_channel(&self, case_id: &CaseId, epoch: u64, channel: ChannelKind, now: DateTime<Utc>) -> Result<VerificationChannel, SuccessionError> {
        self.orchestrator.verify_channel(case_id, epoch, channel, now)
    }

    pub fn add_shard(&self, case_id: &CaseId, epoch: u64, shard: Shard, now: DateTime<Utc>) -> Result<usize, SuccessionError> {
        self.orchestrator.add_shard(case_id, epoch, shard, now)
    }

    pub fn get_case_status(&self, case_id: &CaseId, now: DateTime<Utc>) -> Result<CaseStatus, SuccessionError> {
        self.orchestrator.get_case_status(case_id, now)
    }

    /// Advance a case; a completed case archives its principal.
    pub fn advance_case(&self, case_id: &CaseId, epoch: u64, now: DateTime<Utc>) -> Result<SuccessionCase, SuccessionError> {
        let case = self.orchestrator.advance_case(case_id, epoch, now)?;
        self.archive_if_complete(&case)?;
        Ok(case)
    }

    pub fn resolve_step(&self, case_id: &CaseId, epoch: u64, step: StepKind, now: DateTime<Utc>) -> Result<SuccessionCase, SuccessionError> {
        let case = self.orchestrator.resolve_step(case_id, epoch, step, now)?;
        self.archive_if_complete(&case)?;
        Ok(case)
    }

    fn archive_if_complete(&self, case: &SuccessionCase) -> Result<(), SuccessionError> {
        if case.state == CaseState::Complete {
            self.liveness.archive(&case.principal_id)?;
        }
        Ok(())
    }

    /// One background pass.
    ///
    /// 1. Evaluate every principal, reminding those who are overdue and
    ///    opening or aborting cases as liveness dictates
    /// 2. Re-request lapsed channel confirmations
    /// 3. Push verified and settling cases forward
    ///
    /// A failure on one principal or case is logged and reported, and the
    /// pass continues. Only a broken audit chain stops the whole poll.
    pub fn poll(&self, now: DateTime<Utc>) -> Result<PollReport, SuccessionError> {
        self.orchestrator.audit().ensure_intact()?;

        let mut report = PollReport {
            statuses: self.liveness.statuses(now)?,
            ..PollReport::default()
        };

        for status in &report.statuses {
            let id = &status.principal_id;
            let had_case = self.orchestrator.active_case(id)?.is_some();

            match self.orchestrator.observe_liveness(id, now) {
                Ok(Some(case)) if case.state == CaseState::Aborted => report.aborted.push(case.id),
                Ok(Some(case)) if !had_case => report.opened.push(case.id),
                Ok(_) => {}
                Err(e) => {
                    log::error!("Liveness check for {} failed: {}", id, e);
                    report.errors.push(format!("{}: {}", id, e));
                }
            }

            if !had_case && matches!(status.state, LivenessState::Overdue | LivenessState::Alerting) {
                if let Err(e) = self.remind(status) {
                    report.errors.push(format!("{}: {}", id, e));
                } else {
                    report.reminded.push(id.clone());
                }
            }
        }

        report.reconfirm = self.orchestrator.sweep_verifications(now)?;

        for case in self.orchestrator.active_cases()? {
            if !matches!(
                case.state,
                CaseState::DeathSuspected | CaseState::Verified | CaseState::SettlementInProgress
            ) {
                continue;
            }
            match self.advance_case(&case.id, case.epoch, now) {
                Ok(advanced) => report.advanced.push((advanced.id, advanced.state)),
                Err(e) => {
                    log::warn!("Case {} not advanced: {}", case.id, e);
                    report.errors.push(format!("{}: {}", case.id, e));
                }
            }
        }

        log::info!(
            "Poll: {} principals, {} opened, {} aborted, {} advanced, {} errors",
            report.statuses.len(),
            report.opened.len(),
            report.aborted.len(),
            report.advanced.len(),
            report.errors.len()
        );
        Ok(report)
    }

    fn remind(&self, status: &LivenessStatus) -> Result<(), SuccessionError> {
        let Some(level) = status.state.to_notification_level() else {
            return Ok(());
        };
        let principal = self.liveness.principal(&status.principal_id)?;
        let message = templates::liveness_reminder(
            level,
            principal.id.as_str(),
            status.elapsed.num_days(),
            status.until_succession.num_days(),
        );
        self.orchestrator.send_notice(&principal.channels, &message);
        Ok(())
    }
}
