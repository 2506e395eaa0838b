//! The daemon: SQLite-backed succession service plus the periodic poll loop.

use crate::collaborators::{ConfigBeneficiaries, ConfigExecutorAuth, LoggingEstate};
use crate::config::ServerConfig;
use crate::db::{self, Database, SqliteRepository};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use deadhand_audit::AuditChain;
use deadhand_core::{CaseId, ChannelKind, PrincipalId};
use deadhand_inherit::{
    CaseStatus, CaseStores, Collaborators, DeathVerificationEvent, LivenessError, LivenessMonitor,
    LivenessStatus, PollReport, StepKind, SuccessionCase, SuccessionOrchestrator,
    SuccessionService, VerificationChannel,
};
use deadhand_notify::{LogNotifier, NotificationService};
use deadhand_shamir::{ShamirConfig, Shard};
use std::sync::Arc;
use std::time::Duration;

pub struct Daemon {
    db: Arc<Database>,
    audit: Arc<AuditChain>,
    service: SuccessionService,
}

impl Daemon {
    /// Open the database under the configured data dir, restore the audit
    /// chain and bring enrolled principals in line with the config file.
    pub fn open(config: &ServerConfig, now: DateTime<Utc>) -> Result<Self> {
        std::fs::create_dir_all(&config.server.data_dir).with_context(|| {
            format!(
                "Failed to create data dir: {}",
                config.server.data_dir.display()
            )
        })?;

        let path = config.database_path();
        let db = Arc::new(
            Database::open(&path)
                .with_context(|| format!("Failed to open database: {}", path.display()))?,
        );

        let entries = db.load_audit().context("Failed to load audit log")?;
        log::info!("Restored {} audit entries", entries.len());
        let audit = Arc::new(AuditChain::restore(entries));

        let liveness = Arc::new(LivenessMonitor::new(
            Arc::new(SqliteRepository::new(db.clone(), db::PRINCIPALS)),
            Arc::new(SqliteRepository::new(db.clone(), db::HEARTBEATS)),
        ));
        let stores = CaseStores {
            cases: Arc::new(SqliteRepository::new(db.clone(), db::CASES)),
            quorum: Arc::new(SqliteRepository::new(db.clone(), db::QUORUM)),
            handles: Arc::new(SqliteRepository::new(db.clone(), db::HANDLES)),
        };

        let log_notifier = Arc::new(LogNotifier);
        let notifications = ChannelKind::ALL
            .iter()
            .fold(NotificationService::new(), |service, &channel| {
                service.with_notifier(channel, log_notifier.clone())
            });
        let collaborators = Collaborators {
            beneficiaries: Arc::new(ConfigBeneficiaries::from_config(config)),
            executor_auth: Arc::new(ConfigExecutorAuth::from_config(config)),
            estate: Arc::new(LoggingEstate),
            notifications,
        };

        let orchestrator = SuccessionOrchestrator::new(
            liveness.clone(),
            audit.clone(),
            stores,
            collaborators,
            config.orchestrator_config(),
        );

        let daemon = Self {
            db,
            audit,
            service: SuccessionService::new(liveness, orchestrator),
        };
        daemon.sync_principals(config, now)?;
        Ok(daemon)
    }

    /// Enroll new principals and apply policy changes to existing ones.
    ///
    /// The original enrollment time and the archived flag are kept.
    fn sync_principals(&self, config: &ServerConfig, now: DateTime<Utc>) -> Result<()> {
        let liveness = self.service.liveness();
        for section in &config.principals {
            let id = PrincipalId::new(section.id.as_str());
            let existing = match liveness.principal(&id) {
                Ok(p) => Some(p),
                Err(LivenessError::UnknownPrincipal(_)) => None,
                Err(e) => return Err(e.into()),
            };

            let enrolled_at = existing.as_ref().map(|p| p.enrolled_at).unwrap_or(now);
            let mut principal = section.to_principal(enrolled_at)?;
            principal.archived = existing.as_ref().is_some_and(|p| p.archived);

            if existing.as_ref() != Some(&principal) {
                liveness
                    .enroll(principal)
                    .with_context(|| format!("Failed to enroll principal '{}'", section.id))?;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn service(&self) -> &SuccessionService {
        &self.service
    }

    pub fn audit(&self) -> &AuditChain {
        &self.audit
    }

    /// Write audit entries the database has not seen yet.
    pub fn persist_audit(&self) -> Result<usize> {
        let last = self.db.last_audit_sequence()?;
        let written = self.db.append_audit(&self.audit.entries_after(last))?;
        if written > 0 {
            log::debug!("Persisted {} audit entries after #{}", written, last);
        }
        Ok(written)
    }

    /// Run `op` and persist whatever it appended to the audit chain, even
    /// when it failed part-way.
    fn audited<T>(&self, op: impl FnOnce(&SuccessionService) -> Result<T>) -> Result<T> {
        let result = op(&self.service);
        self.persist_audit().context("Failed to persist audit log")?;
        result
    }

    // ========================================================================
    // Operations
    // ========================================================================

    pub fn ping(&self, principal: &str, now: DateTime<Utc>) -> Result<LivenessStatus> {
        self.audited(|s| Ok(s.ping(&PrincipalId::new(principal), now)?))
    }

    pub fn report_death(
        &self,
        principal: &str,
        verified_by: &str,
        now: DateTime<Utc>,
    ) -> Result<SuccessionCase> {
        let event = DeathVerificationEvent {
            principal_id: PrincipalId::new(principal),
            verified_by: verified_by.to_string(),
            timestamp: now,
        };
        self.audited(|s| Ok(s.report_death(&event, now)?))
    }

    pub fn confirm(
        &self,
        case_id: &str,
        epoch: u64,
        channel: ChannelKind,
        now: DateTime<Utc>,
    ) -> Result<VerificationChannel> {
        self.audited(|s| Ok(s.verify_channel(&CaseId::new(case_id), epoch, channel, now)?))
    }

    /// Submit shards and try the verification gate in one go.
    ///
    /// Shards are only ever held in memory, so they must reach the same
    /// process that evaluates the gate.
    pub fn submit_shards(
        &self,
        case_id: &str,
        epoch: u64,
        shards: Vec<Shard>,
        now: DateTime<Utc>,
    ) -> Result<SuccessionCase> {
        let case_id = CaseId::new(case_id);
        self.audited(|s| {
            for shard in shards {
                let held = s.add_shard(&case_id, epoch, shard, now)?;
                log::info!("[{}] {} shard(s) held", case_id, held);
            }
            Ok(s.advance_case(&case_id, epoch, now)?)
        })
    }

    pub fn advance(&self, case_id: &str, epoch: u64, now: DateTime<Utc>) -> Result<SuccessionCase> {
        self.audited(|s| Ok(s.advance_case(&CaseId::new(case_id), epoch, now)?))
    }

    pub fn resolve_step(
        &self,
        case_id: &str,
        epoch: u64,
        step: StepKind,
        now: DateTime<Utc>,
    ) -> Result<SuccessionCase> {
        self.audited(|s| Ok(s.resolve_step(&CaseId::new(case_id), epoch, step, now)?))
    }

    pub fn case_status(&self, case_id: &str, now: DateTime<Utc>) -> Result<CaseStatus> {
        Ok(self
            .service
            .get_case_status(&CaseId::new(case_id), now)?)
    }

    /// Split a principal's secret and register its handle. The caller hands
    /// the returned shards to custodians; they are not stored.
    pub fn split_secret(
        &self,
        principal: &str,
        config: ShamirConfig,
        secret: &[u8],
    ) -> Result<Vec<Shard>> {
        let (handle, shards) = config.split(secret)?;
        self.service
            .orchestrator()
            .register_secret(&PrincipalId::new(principal), &handle)?;
        Ok(shards)
    }

    pub fn acknowledge_break(&self, operator: &str) -> Result<u64> {
        self.audited(|_| {
            let entry = self.audit.acknowledge_break(operator)?;
            Ok(entry.sequence)
        })
    }

    /// Execute a single check cycle and persist its audit trail.
    pub fn run_check_cycle(&self, now: DateTime<Utc>) -> Result<PollReport> {
        log::info!("Starting check cycle…");
        let report = self.audited(|s| Ok(s.poll(now)?))?;

        for status in &report.statuses {
            log::info!(
                "{}: {:?}, {} day(s) since last check-in",
                status.principal_id,
                status.state,
                status.elapsed.num_days()
            );
        }
        for id in &report.opened {
            log::warn!("Opened succession case {}", id);
        }
        for id in &report.aborted {
            log::info!("Aborted succession case {}", id);
        }
        for (id, state) in &report.advanced {
            log::info!("Case {} advanced to {}", id, state.as_str());
        }
        for error in &report.errors {
            log::error!("{}", error);
        }
        let hung = self.service.orchestrator().hung_calls();
        if hung > 0 {
            log::warn!("{} collaborator call(s) still hanging after timeout", hung);
        }
        Ok(report)
    }
}

/// Run the daemon loop. Blocks forever (until shutdown signal).
pub async fn run(config: ServerConfig) -> Result<()> {
    log::info!("Deadhand server starting…");
    log::info!(
        "  Interval:   {} seconds ({:.1} hours)",
        config.server.check_interval_secs,
        config.server.check_interval_secs as f64 / 3600.0
    );
    log::info!("  Data dir:   {}", config.server.data_dir.display());
    log::info!("  Principals: {}", config.principals.len());
    log::info!("  Deadlock:   {} days", config.succession.deadlock_days);

    let daemon = Arc::new(Daemon::open(&config, Utc::now())?);
    let interval = Duration::from_secs(config.server.check_interval_secs);

    // Run first check immediately, then loop
    let mut first = true;
    loop {
        if !first {
            log::info!(
                "Sleeping {} seconds until next check…",
                config.server.check_interval_secs
            );
            tokio::time::sleep(interval).await;
        }
        first = false;

        let cycle = daemon.clone();
        match tokio::task::spawn_blocking(move || cycle.run_check_cycle(Utc::now())).await {
            Ok(Ok(_)) => log::info!("Check cycle completed successfully."),
            Ok(Err(e)) => log::error!("Check cycle failed: {:#}", e),
            Err(e) => log::error!("Check cycle panicked: {}", e),
        }
    }
}
