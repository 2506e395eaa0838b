//! Built-in collaborators for a standalone deployment.
//!
//! Beneficiary allocations and executor authorizations come from the config
//! file. Estate operations are recorded in the log for an operator to carry
//! out; there is no custodian integration.

use crate::config::{ExecutorPair, ServerConfig};
use deadhand_core::{CaseId, PrincipalId};
use deadhand_inherit::{
    Authorization, BeneficiaryTree, CollaboratorError, EstateOperations, ExecutorAuth, StepKind,
};
use std::collections::HashMap;

/// Beneficiary check against the configured allocation.
///
/// An allocation is valid when it is non-empty, every share is positive and
/// the shares sum to exactly 100 percent.
pub struct ConfigBeneficiaries {
    allocations: HashMap<String, Vec<u32>>,
}

impl ConfigBeneficiaries {
    pub fn from_config(config: &ServerConfig) -> Self {
        let allocations = config
            .principals
            .iter()
            .map(|p| {
                (
                    p.id.clone(),
                    p.beneficiaries.iter().map(|b| b.percent).collect(),
                )
            })
            .collect();
        Self { allocations }
    }
}

impl BeneficiaryTree for ConfigBeneficiaries {
    fn validate(&self, principal: &PrincipalId) -> Result<bool, CollaboratorError> {
        let Some(shares) = self.allocations.get(principal.as_str()) else {
            log::warn!("No beneficiary allocation configured for {}", principal);
            return Ok(false);
        };
        let valid = !shares.is_empty()
            && shares.iter().all(|&s| s > 0)
            && shares.iter().sum::<u32>() == 100;
        if !valid {
            log::warn!("Beneficiary allocation for {} does not sum to 100%", principal);
        }
        Ok(valid)
    }
}

/// Executor authorization against the configured pairs.
pub struct ConfigExecutorAuth {
    authorized: Vec<ExecutorPair>,
}

impl ConfigExecutorAuth {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            authorized: config.collaborators.authorized_executors.clone(),
        }
    }
}

impl ExecutorAuth for ConfigExecutorAuth {
    fn verify_authorization(
        &self,
        executor_id: &str,
        doc_id: &str,
    ) -> Result<Authorization, CollaboratorError> {
        let authorized = self
            .authorized
            .iter()
            .any(|pair| pair.executor_id == executor_id && pair.doc_id == doc_id);
        Ok(Authorization { authorized })
    }
}

/// Estate operations that only record what an operator must do.
#[derive(Debug, Default)]
pub struct LoggingEstate;

impl EstateOperations for LoggingEstate {
    fn value_estate(&self, principal: &PrincipalId, case_id: &CaseId) -> Result<(), CollaboratorError> {
        log::info!("[{}] Valuation requested for estate of {}", case_id, principal);
        Ok(())
    }

    fn fund_trust(&self, principal: &PrincipalId, case_id: &CaseId) -> Result<(), CollaboratorError> {
        log::info!("[{}] Trust funding requested for {}", case_id, principal);
        Ok(())
    }

    fn reparent_assets(&self, principal: &PrincipalId, case_id: &CaseId) -> Result<(), CollaboratorError> {
        log::info!("[{}] Asset re-parenting requested for {}", case_id, principal);
        Ok(())
    }

    fn liquidate(
        &self,
        principal: &PrincipalId,
        case_id: &CaseId,
        step: StepKind,
    ) -> Result<String, CollaboratorError> {
        let action = format!(
            "liquidation of {}'s blocking holdings ordered to clear {}",
            principal, step
        );
        log::warn!("[{}] {}", case_id, action);
        Ok(action)
    }
}
