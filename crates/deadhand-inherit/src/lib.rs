//! Deadhand Inheritance
//!
//! Dead-man's-switch succession: when a principal stops checking in (or a
//! death is reported), verify the claim through independent channels and
//! shard custodians, then settle the estate.
//!
//! # Components
//!
//! - [`LivenessMonitor`]: heartbeats and the Active -> Overdue -> Alerting ->
//!   SuccessionPending escalation
//! - [`QuorumVerifier`]: expiring per-channel confirmations
//! - [`SuccessionOrchestrator`]: the case state machine, gated on quorum
//!   *and* secret reconstruction, with every transition audited
//! - [`LiquidationEnforcer`]: forces deadlocked settlement steps to resolve
//! - [`SuccessionService`]: the public facade and background poll
//!
//! # Flow
//!
//! ```text
//! silence >= succession_after ──┐
//! death report ─────────────────┴─> case opens (VerificationPending)
//!     channels confirm + custodians submit shards
//!     advance: quorum met && shards reconstruct -> Verified
//!     advance: settlement steps in order -> Complete
//! a check-in before Verified aborts the case
//! ```

pub mod case;
pub mod collaborators;
pub mod error;
pub mod heartbeat;
pub mod orchestrator;
pub mod quorum;
pub mod service;
pub mod settlement;

#[cfg(test)]
mod test_utils;

pub use case::{CaseState, CaseTrigger, SuccessionCase};
pub use collaborators::{
    Authorization, BeneficiaryTree, CollaboratorError, Collaborators, DeathVerificationEvent,
    EstateOperations, ExecutorAuth,
};
pub use error::SuccessionError;
pub use heartbeat::{
    evaluate_batch, evaluate_liveness, Heartbeat, LivenessError, LivenessMonitor, LivenessState,
    LivenessStatus,
};
pub use orchestrator::{CaseStatus, CaseStores, OrchestratorConfig, SuccessionOrchestrator};
pub use quorum::{QuorumError, QuorumState, QuorumStatus, QuorumVerifier, VerificationChannel};
pub use service::{PollReport, SuccessionService};
pub use settlement::{
    LiquidationDecision, LiquidationEnforcer, Settlement, SettlementStep, StepKind, StepStatus,
    DEFAULT_DEADLOCK_DAYS,
};
