//! Deadhand Core
//!
//! Shared types for the Deadhand succession service.
//!
//! # Contents
//!
//! - **Identifiers**: `PrincipalId`, `CaseId`
//! - **Principal**: the enrolled identity and its per-principal policies
//!   (liveness durations, verification quorum, executor designation)
//! - **Repository**: the load/save-by-id persistence seam injected into
//!   every stateful component, plus an in-memory implementation
//! - **Keyed locks**: single-writer discipline per entity id
//! - **Bounded calls**: timeouts for collaborators and notifiers, with a cap
//!   on how many hung calls may pile up
//!
//! Configuration always travels with the principal or case it governs.
//! Nothing in this crate holds process-global state.

pub mod bounded;
pub mod duration_secs;
pub mod ids;
pub mod locks;
pub mod principal;
pub mod repository;

pub use bounded::{BoundedCallError, CallBudget};
pub use ids::{CaseId, PrincipalId};
pub use locks::KeyedLocks;
pub use principal::{
    ChannelKind, ExecutorDesignation, LivenessPolicy, PolicyError, Principal, QuorumPolicy,
};
pub use repository::{MemoryRepository, Repository, RepositoryError};
