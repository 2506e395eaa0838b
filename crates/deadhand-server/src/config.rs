//! Server configuration, parsed from a TOML file with environment overrides.
//!
//! Environment variables win over the file, and the file wins over defaults.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use deadhand_core::{ChannelKind, LivenessPolicy, Principal, QuorumPolicy};
use deadhand_inherit::{LiquidationEnforcer, OrchestratorConfig, DEFAULT_DEADLOCK_DAYS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything the daemon reads from `deadhand.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// `[server]`
    #[serde(default)]
    pub server: ServerSection,

    /// Orchestrator settings shared by every case
    #[serde(default)]
    pub succession: SuccessionSection,

    /// Principals to monitor
    #[serde(default)]
    pub principals: Vec<PrincipalSection>,

    /// Reference data for the built-in collaborators
    #[serde(default)]
    pub collaborators: CollaboratorSection,
}

/// Daemon process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Data directory (SQLite DB)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Check interval in seconds (default: 1 hour)
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            check_interval_secs: default_check_interval(),
            log_level: default_log_level(),
        }
    }
}

/// Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessionSection {
    /// Days a settlement step may stay blocked before forced liquidation
    #[serde(default = "default_deadlock_days")]
    pub deadlock_days: i64,

    /// Upper bound on any single collaborator call
    #[serde(default = "default_collaborator_timeout")]
    pub collaborator_timeout_secs: u64,
}

impl Default for SuccessionSection {
    fn default() -> Self {
        Self {
            deadlock_days: default_deadlock_days(),
            collaborator_timeout_secs: default_collaborator_timeout(),
        }
    }
}

/// One monitored principal and its policies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrincipalSection {
    pub id: String,

    #[serde(default = "default_overdue_days")]
    pub overdue_after_days: i64,

    #[serde(default = "default_alert_days")]
    pub alert_after_days: i64,

    #[serde(default = "default_succession_days")]
    pub succession_after_days: i64,

    /// Verification channels ("email", "sms", "nostr", "phone", "attorney")
    pub channels: Vec<String>,

    #[serde(default = "default_quorum_minimum")]
    pub quorum_minimum: usize,

    #[serde(default = "default_verification_window")]
    pub verification_window_hours: i64,

    /// Designated executor
    pub executor_id: Option<String>,

    /// Document the executor acts under
    pub authorization_doc: Option<String>,

    /// Allocation checked before assets are re-parented
    #[serde(default)]
    pub beneficiaries: Vec<BeneficiarySection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeneficiarySection {
    pub label: String,
    pub percent: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollaboratorSection {
    /// Executor / document pairs that are authorized
    #[serde(default)]
    pub authorized_executors: Vec<ExecutorPair>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorPair {
    pub executor_id: String,
    pub doc_id: String,
}

// ============================================================================
// Defaults
// ============================================================================

fn default_data_dir() -> PathBuf {
    PathBuf::from("/data")
}

fn default_check_interval() -> u64 {
    3600 // 1 hour
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_deadlock_days() -> i64 {
    DEFAULT_DEADLOCK_DAYS
}

fn default_collaborator_timeout() -> u64 {
    30
}

fn default_overdue_days() -> i64 {
    90
}

fn default_alert_days() -> i64 {
    120
}

fn default_succession_days() -> i64 {
    180
}

fn default_quorum_minimum() -> usize {
    2
}

fn default_verification_window() -> i64 {
    72
}

// ============================================================================
// Loading and overrides
// ============================================================================

impl ServerConfig {
    /// Read and parse a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: ServerConfig =
            toml::from_str(&contents).with_context(|| "parsing config TOML")?;
        Ok(config)
    }

    /// Overlay `DEADHAND_*` environment variables onto the loaded file.
    ///
    /// Recognised variables:
    /// - `DEADHAND_DATA_DIR`
    /// - `DEADHAND_CHECK_INTERVAL`
    /// - `DEADHAND_LOG_LEVEL`
    /// - `DEADHAND_DEADLOCK_DAYS`
    /// - `DEADHAND_COLLABORATOR_TIMEOUT`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DEADHAND_DATA_DIR") {
            self.server.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DEADHAND_CHECK_INTERVAL") {
            if let Ok(secs) = v.parse::<u64>() {
                self.server.check_interval_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("DEADHAND_LOG_LEVEL") {
            self.server.log_level = v;
        }
        if let Ok(v) = std::env::var("DEADHAND_DEADLOCK_DAYS") {
            if let Ok(days) = v.parse::<i64>() {
                self.succession.deadlock_days = days;
            }
        }
        if let Ok(v) = std::env::var("DEADHAND_COLLABORATOR_TIMEOUT") {
            if let Ok(secs) = v.parse::<u64>() {
                self.succession.collaborator_timeout_secs = secs;
            }
        }
    }

    /// Reject configs the daemon could not run with, including bad principal policies.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.server.check_interval_secs >= 60,
            "server.check_interval_secs must be >= 60"
        );
        anyhow::ensure!(
            self.succession.deadlock_days > 0,
            "succession.deadlock_days must be > 0"
        );
        anyhow::ensure!(
            self.succession.collaborator_timeout_secs > 0,
            "succession.collaborator_timeout_secs must be > 0"
        );

        let mut seen = std::collections::HashSet::new();
        for section in &self.principals {
            anyhow::ensure!(
                seen.insert(section.id.as_str()),
                "principal '{}' is configured twice",
                section.id
            );
            // Builds and validates every policy the principal carries
            section
                .to_principal(Utc::now())
                .with_context(|| format!("principal '{}'", section.id))?;
        }

        Ok(())
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            collaborator_timeout: std::time::Duration::from_secs(
                self.succession.collaborator_timeout_secs,
            ),
            liquidation: LiquidationEnforcer::from_days(self.succession.deadlock_days),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.server.data_dir.join("deadhand.db")
    }
}

impl PrincipalSection {
    /// Build the principal this section describes, enrolled at `enrolled_at`.
    pub fn to_principal(&self, enrolled_at: DateTime<Utc>) -> Result<Principal> {
        let channels = self
            .channels
            .iter()
            .map(|c| c.parse::<ChannelKind>())
            .collect::<Result<Vec<_>, _>>()?;

        let mut principal = Principal::new(self.id.clone(), channels, enrolled_at)
            .with_liveness(LivenessPolicy::from_days(
                self.overdue_after_days,
                self.alert_after_days,
                self.succession_after_days,
            ))
            .with_quorum(QuorumPolicy {
                minimum: self.quorum_minimum,
                verification_window: Duration::hours(self.verification_window_hours),
            });

        match (&self.executor_id, &self.authorization_doc) {
            (Some(executor), Some(doc)) => {
                principal = principal.with_executor(executor.clone(), doc.clone());
            }
            (None, None) => {}
            _ => anyhow::bail!("executor_id and authorization_doc must be set together"),
        }

        principal.validate()?;
        Ok(principal)
    }
}

// ============================================================================
// Tests
// ============================================================================
