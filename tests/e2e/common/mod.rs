//! Shared world for the end-to-end suites: in-memory stores, a recording
//! notifier and collaborators whose answers the test controls.

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use deadhand_audit::AuditChain;
use deadhand_core::{
    CaseId, ChannelKind, MemoryRepository, Principal, PrincipalId, QuorumPolicy, Repository,
};
use deadhand_inherit::{
    Authorization, BeneficiaryTree, CaseStores, CollaboratorError, Collaborators,
    EstateOperations, ExecutorAuth, Heartbeat, LiquidationEnforcer, LivenessMonitor,
    OrchestratorConfig, StepKind, SuccessionCase, SuccessionOrchestrator, SuccessionService,
};
use deadhand_notify::{MemoryNotifier, NotificationService};
use deadhand_shamir::{ShamirConfig, Shard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

pub fn day(n: i64) -> DateTime<Utc> {
    t0() + Duration::days(n)
}

/// Collaborators with switchable answers.
#[derive(Default)]
pub struct Registry {
    pub executor_authorized: AtomicBool,
    pub beneficiaries_valid: AtomicBool,
    pub slow: AtomicBool,
    pub liquidated: Mutex<Vec<StepKind>>,
    pub calls: Mutex<Vec<&'static str>>,
}

impl Registry {
    pub fn cooperative() -> Self {
        let registry = Self::default();
        registry.executor_authorized.store(true, Ordering::SeqCst);
        registry.beneficiaries_valid.store(true, Ordering::SeqCst);
        registry
    }

    fn call(&self, name: &'static str) {
        if self.slow.load(Ordering::SeqCst) {
            thread::sleep(std::time::Duration::from_millis(300));
        }
        self.calls.lock().unwrap().push(name);
    }
}

impl BeneficiaryTree for Registry {
    fn validate(&self, _: &PrincipalId) -> Result<bool, CollaboratorError> {
        self.call("beneficiaries");
        Ok(self.beneficiaries_valid.load(Ordering::SeqCst))
    }
}

impl ExecutorAuth for Registry {
    fn verify_authorization(&self, _: &str, _: &str) -> Result<Authorization, CollaboratorError> {
        self.call("executor_auth");
        Ok(Authorization {
            authorized: self.executor_authorized.load(Ordering::SeqCst),
        })
    }
}

impl EstateOperations for Registry {
    fn value_estate(&self, _: &PrincipalId, _: &CaseId) -> Result<(), CollaboratorError> {
        self.call("value_estate");
        Ok(())
    }

    fn fund_trust(&self, _: &PrincipalId, _: &CaseId) -> Result<(), CollaboratorError> {
        self.call("fund_trust");
        Ok(())
    }

    fn reparent_assets(&self, _: &PrincipalId, _: &CaseId) -> Result<(), CollaboratorError> {
        self.call("reparent_assets");
        Ok(())
    }

    fn liquidate(&self, _: &PrincipalId, _: &CaseId, step: StepKind) -> Result<String, CollaboratorError> {
        self.liquidated.lock().unwrap().push(step);
        Ok(format!("sold holdings blocking {}", step))
    }
}

pub struct World {
    pub liveness: Arc<LivenessMonitor>,
    pub stores: CaseStores,
    pub audit: Arc<AuditChain>,
    pub notifier: Arc<MemoryNotifier>,
    pub registry: Arc<Registry>,
    pub service: SuccessionService,
    pub shards: Vec<Shard>,
    pub alice: PrincipalId,
}

impl World {
    /// Alice enrolled at t0 with the default 90/120/180 policy, a 2-of-2
    /// email+sms quorum and a 2-of-3 secret split.
    pub fn new() -> Self {
        let principals: Arc<dyn Repository<Principal>> = Arc::new(MemoryRepository::new());
        let heartbeats: Arc<dyn Repository<Heartbeat>> = Arc::new(MemoryRepository::new());
        let liveness = Arc::new(LivenessMonitor::new(principals, heartbeats));
        let stores = CaseStores::in_memory();
        let audit = Arc::new(AuditChain::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let registry = Arc::new(Registry::cooperative());

        let service = build_service(&liveness, &stores, &audit, &notifier, &registry);
        let alice = Principal::new("alice", vec![ChannelKind::Email, ChannelKind::Sms], t0())
            .with_quorum(QuorumPolicy {
                minimum: 2,
                verification_window: Duration::hours(72),
            })
            .with_executor("exec-1", "will-2024");
        let (handle, shards) = ShamirConfig::two_of_three().split(b"estate master key").unwrap();
        service.enroll(alice, &handle).unwrap();

        Self {
            liveness,
            stores,
            audit,
            notifier,
            registry,
            service,
            shards,
            alice: PrincipalId::new("alice"),
        }
    }

    /// Replace the audit chain, keeping every store. Simulates a restart.
    pub fn restart_with_audit(&mut self, audit: AuditChain) {
        self.audit = Arc::new(audit);
        self.service = build_service(
            &self.liveness,
            &self.stores,
            &self.audit,
            &self.notifier,
            &self.registry,
        );
    }

    /// Silence until succession, then confirm both channels and submit two
    /// shards. Returns the verified case.
    pub fn verify_by_silence(&self) -> SuccessionCase {
        let report = self.service.poll(day(181)).unwrap();
        assert_eq!(report.opened.len(), 1, "errors: {:?}", report.errors);
        let case = self.service.orchestrator().case(&report.opened[0]).unwrap();

        for channel in [ChannelKind::Email, ChannelKind::Sms] {
            self.service
                .verify_channel(&case.id, case.epoch, channel, day(181))
                .unwrap();
        }
        for shard in &self.shards[1..] {
            self.service
                .add_shard(&case.id, case.epoch, shard.clone(), day(181))
                .unwrap();
        }
        self.service.advance_case(&case.id, case.epoch, day(181)).unwrap()
    }

    pub fn transitions(&self) -> Vec<String> {
        self.audit
            .entries()
            .iter()
            .filter(|e| e.event() == Some("case_transition"))
            .filter_map(|e| e.payload["to"].as_str().map(str::to_string))
            .collect()
    }
}

fn build_service(
    liveness: &Arc<LivenessMonitor>,
    stores: &CaseStores,
    audit: &Arc<AuditChain>,
    notifier: &Arc<MemoryNotifier>,
    registry: &Arc<Registry>,
) -> SuccessionService {
    let collaborators = Collaborators {
        beneficiaries: registry.clone(),
        executor_auth: registry.clone(),
        estate: registry.clone(),
        notifications: NotificationService::new()
            .with_notifier(ChannelKind::Email, notifier.clone())
            .with_notifier(ChannelKind::Sms, notifier.clone()),
    };
    let orchestrator = SuccessionOrchestrator::new(
        liveness.clone(),
        audit.clone(),
        stores.clone(),
        collaborators,
        OrchestratorConfig {
            collaborator_timeout: std::time::Duration::from_millis(100),
            liquidation: LiquidationEnforcer::default(),
        },
    );
    SuccessionService::new(liveness.clone(), orchestrator)
}
