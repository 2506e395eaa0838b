//! Shared fixtures for unit tests.

use crate::case::SuccessionCase;
use crate::collaborators::{
    Authorization, BeneficiaryTree, CollaboratorError, Collaborators, EstateOperations,
    ExecutorAuth,
};
use crate::heartbeat::{Heartbeat, LivenessMonitor};
use crate::orchestrator::{CaseStores, OrchestratorConfig, SuccessionOrchestrator};
use crate::quorum::QuorumState;
use crate::service::SuccessionService;
use crate::settlement::{LiquidationEnforcer, StepKind};
use crate::SuccessionError;
use chrono::{DateTime, Duration, TimeZone, Utc};
use deadhand_audit::AuditChain;
use deadhand_core::{
    CaseId, ChannelKind, MemoryRepository, Principal, PrincipalId, QuorumPolicy, Repository,
    RepositoryError,
};
use deadhand_notify::{
    MemoryNotifier, NotificationMessage, NotificationService, Notifier, NotifyError,
};
use deadhand_shamir::Shard;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
}

pub fn days(n: i64) -> Duration {
    Duration::days(n)
}

pub fn principal(id: &str) -> Principal {
    Principal::new(id, vec![ChannelKind::Email, ChannelKind::Sms], t0())
        .with_quorum(QuorumPolicy {
            minimum: 2,
            verification_window: Duration::hours(72),
        })
        .with_executor("exec-1", "will-2024")
}

pub fn memory_monitor() -> LivenessMonitor {
    let principals: Arc<dyn Repository<Principal>> = Arc::new(MemoryRepository::new());
    let heartbeats: Arc<dyn Repository<Heartbeat>> = Arc::new(MemoryRepository::new());
    LivenessMonitor::new(principals, heartbeats)
}

/// Records messages, or hangs on every send once told to.
#[derive(Default)]
pub struct StubNotifier {
    memory: MemoryNotifier,
    hanging: AtomicBool,
}

impl StubNotifier {
    pub fn set_hanging(&self, hanging: bool) {
        self.hanging.store(hanging, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(ChannelKind, NotificationMessage)> {
        self.memory.sent()
    }
}

impl Notifier for StubNotifier {
    fn send(&self, channel: ChannelKind, message: &NotificationMessage) -> Result<(), NotifyError> {
        if self.hanging.load(Ordering::SeqCst) {
            thread::sleep(std::time::Duration::from_secs(3));
            return Ok(());
        }
        self.memory.send(channel, message)
    }
}

/// In-memory store that can be switched to fail every call.
pub struct FlakyRepository<T> {
    inner: MemoryRepository<T>,
    failing: AtomicBool,
}

impl<T> FlakyRepository<T> {
    pub fn new() -> Self {
        Self {
            inner: MemoryRepository::new(),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), RepositoryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RepositoryError::Backend("disk unavailable".into()));
        }
        Ok(())
    }
}

impl<T: Clone + Send + Sync> Repository<T> for FlakyRepository<T> {
    fn load(&self, id: &str) -> Result<Option<T>, RepositoryError> {
        self.check()?;
        self.inner.load(id)
    }

    fn save(&self, id: &str, value: &T) -> Result<(), RepositoryError> {
        self.check()?;
        self.inner.save(id, value)
    }

    fn ids(&self) -> Result<Vec<String>, RepositoryError> {
        self.check()?;
        self.inner.ids()
    }
}

#[derive(Default)]
pub struct StubEstate {
    calls: Mutex<Vec<&'static str>>,
    slow: AtomicBool,
}

impl StubEstate {
    pub fn set_slow(&self, slow: bool) {
        self.slow.store(slow, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn call(&self, name: &'static str) -> Result<(), CollaboratorError> {
        if self.slow.load(Ordering::SeqCst) {
            thread::sleep(std::time::Duration::from_millis(500));
            return Ok(());
        }
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(name);
        Ok(())
    }
}

impl EstateOperations for StubEstate {
    fn value_estate(&self, _: &PrincipalId, _: &CaseId) -> Result<(), CollaboratorError> {
        self.call("value")
    }

    fn fund_trust(&self, _: &PrincipalId, _: &CaseId) -> Result<(), CollaboratorError> {
        self.call("fund")
    }

    fn reparent_assets(&self, _: &PrincipalId, _: &CaseId) -> Result<(), CollaboratorError> {
        self.call("reparent")
    }

    fn liquidate(&self, _: &PrincipalId, case_id: &CaseId, step: StepKind) -> Result<String, CollaboratorError> {
        self.call("liquidate")?;
        Ok(format!("liquidated estate of {} to clear {}", case_id, step))
    }
}

pub struct StubExecutorAuth {
    authorized: AtomicBool,
}

impl StubExecutorAuth {
    pub fn set_authorized(&self, authorized: bool) {
        self.authorized.store(authorized, Ordering::SeqCst);
    }
}

impl ExecutorAuth for StubExecutorAuth {
    fn verify_authorization(&self, _: &str, _: &str) -> Result<Authorization, CollaboratorError> {
        Ok(Authorization {
            authorized: self.authorized.load(Ordering::SeqCst),
        })
    }
}

pub struct StubBeneficiaries {
    valid: AtomicBool,
}

impl StubBeneficiaries {
    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::SeqCst);
    }
}

impl BeneficiaryTree for StubBeneficiaries {
    fn validate(&self, _: &PrincipalId) -> Result<bool, CollaboratorError> {
        Ok(self.valid.load(Ordering::SeqCst))
    }
}

/// One enrolled principal ("alice", 2-of-3 secret, EMAIL + SMS quorum of 2)
/// wired to in-memory stores and stub collaborators.
pub struct Harness {
    pub alice: PrincipalId,
    pub shards: Vec<Shard>,
    pub liveness: Arc<LivenessMonitor>,
    pub audit: Arc<AuditChain>,
    pub notifier: Arc<StubNotifier>,
    pub estate: Arc<StubEstate>,
    pub executor: Arc<StubExecutorAuth>,
    pub beneficiaries: Arc<StubBeneficiaries>,
    pub quorum_store: Arc<FlakyRepository<QuorumState>>,
    pub stores: CaseStores,
    pub service: SuccessionService,
}

impl Harness {
    pub fn new() -> Self {
        let liveness = Arc::new(memory_monitor());
        let audit = Arc::new(AuditChain::new());
        let notifier = Arc::new(StubNotifier::default());
        let estate = Arc::new(StubEstate::default());
        let executor = Arc::new(StubExecutorAuth {
            authorized: AtomicBool::new(true),
        });
        let beneficiaries = Arc::new(StubBeneficiaries {
            valid: AtomicBool::new(true),
        });
        let quorum_store = Arc::new(FlakyRepository::new());
        let stores = CaseStores {
            quorum: quorum_store.clone(),
            ..CaseStores::in_memory()
        };

        let service = build_service(
            &liveness,
            &audit,
            &stores,
            &notifier,
            &estate,
            &executor,
            &beneficiaries,
        );

        let (handle, shards) = deadhand_shamir::split(b"master-seed", 3, 2).unwrap();
        let alice = principal("alice");
        let id = alice.id.clone();
        service.enroll(alice, &handle).unwrap();

        Self {
            alice: id,
            shards,
            liveness,
            audit,
            notifier,
            estate,
            executor,
            beneficiaries,
            quorum_store,
            stores,
            service,
        }
    }

    /// Same stores and collaborators, different audit chain.
    pub fn with_audit(self, audit: Arc<AuditChain>) -> Self {
        let service = build_service(
            &self.liveness,
            &audit,
            &self.stores,
            &self.notifier,
            &self.estate,
            &self.executor,
            &self.beneficiaries,
        );
        Self {
            audit,
            service,
            ..self
        }
    }

    pub fn orchestrator(&self) -> &SuccessionOrchestrator {
        self.service.orchestrator()
    }

    /// `n` days after enrollment.
    pub fn at(&self, n: i64) -> DateTime<Utc> {
        t0() + days(n)
    }

    /// Let alice go silent past the succession threshold.
    pub fn open_by_silence(&self) -> SuccessionCase {
        self.orchestrator()
            .observe_liveness(&self.alice, self.at(181))
            .unwrap()
            .unwrap()
    }

    pub fn confirm_all(&self, case: &SuccessionCase) {
        for channel in [ChannelKind::Email, ChannelKind::Sms] {
            self.orchestrator()
                .verify_channel(&case.id, case.epoch, channel, self.at(181))
                .unwrap();
        }
    }

    pub fn submit_shards(&self, case: &SuccessionCase, n: usize) {
        for shard in self.shards.iter().take(n) {
            self.orchestrator()
                .add_shard(&case.id, case.epoch, shard.clone(), self.at(181))
                .unwrap();
        }
    }

    pub fn advance(&self, case: &SuccessionCase) -> Result<SuccessionCase, SuccessionError> {
        self.orchestrator()
            .advance_case(&case.id, case.epoch, self.at(181))
    }
}

fn build_service(
    liveness: &Arc<LivenessMonitor>,
    audit: &Arc<AuditChain>,
    stores: &CaseStores,
    notifier: &Arc<StubNotifier>,
    estate: &Arc<StubEstate>,
    executor: &Arc<StubExecutorAuth>,
    beneficiaries: &Arc<StubBeneficiaries>,
) -> SuccessionService {
    let notifications = NotificationService::new()
        .with_notifier(ChannelKind::Email, notifier.clone())
        .with_notifier(ChannelKind::Sms, notifier.clone());
    let collaborators = Collaborators {
        beneficiaries: beneficiaries.clone(),
        executor_auth: executor.clone(),
        estate: estate.clone(),
        notifications,
    };
    let config = OrchestratorConfig {
        collaborator_timeout: std::time::Duration::from_millis(100),
        liquidation: LiquidationEnforcer::default(),
    };
    let orchestrator = SuccessionOrchestrator::new(
        liveness.clone(),
        audit.clone(),
        stores.clone(),
        collaborators,
        config,
    );
    SuccessionService::new(liveness.clone(), orchestrator)
}
