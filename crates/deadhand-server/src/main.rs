//! Deadhand Server: headless succession daemon and operator CLI
//!
//! Monitors principal liveness, opens succession cases, and drives verified
//! cases through settlement. Operator commands act on the same SQLite
//! database the daemon uses.
//!
//! # Usage
//!
//! ```bash
//! deadhand-server --config /path/to/deadhand.toml
//! deadhand-server --check    # Run one check cycle and exit
//! deadhand-server --validate # Validate config and exit
//! ```

mod cli;
mod collaborators;
mod config;
mod daemon;
mod db;

use anyhow::{Context, Result};
use chrono::Utc;
use cli::Command;
use daemon::Daemon;
use deadhand_inherit::SuccessionCase;
use deadhand_shamir::{ShamirConfig, Shard};
use std::io::Read;
use zeroize::Zeroizing;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = cli::parse_args(&args)?;

    match cli.command {
        Command::Help => {
            print_help();
            return Ok(());
        }
        Command::Version => {
            println!("deadhand-server {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    // Load config
    let mut server_config = config::ServerConfig::from_file(&cli.config_path)
        .with_context(|| format!("Failed to load config from {}", cli.config_path.display()))?;

    // Apply env overrides
    server_config.apply_env_overrides();

    // Validate
    server_config
        .validate()
        .context("Configuration validation failed")?;

    // Init logger
    std::env::set_var("RUST_LOG", &server_config.server.log_level);
    env_logger::init();

    match cli.command {
        Command::Validate => {
            println!("✅ Configuration is valid.");
            println!("  Data dir:       {}", server_config.server.data_dir.display());
            println!(
                "  Check interval: {} secs",
                server_config.server.check_interval_secs
            );
            println!(
                "  Deadlock:       {} days",
                server_config.succession.deadlock_days
            );
            for p in &server_config.principals {
                println!(
                    "  Principal {}: {}/{}/{} days, {} of {} channels",
                    p.id,
                    p.overdue_after_days,
                    p.alert_after_days,
                    p.succession_after_days,
                    p.quorum_minimum,
                    p.channels.len()
                );
            }
            Ok(())
        }
        Command::Run => run_daemon(server_config),
        command => run_command(&server_config, command),
    }
}

fn run_daemon(server_config: config::ServerConfig) -> Result<()> {
    // Build tokio runtime
    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;

    // Install Ctrl-C handler for graceful shutdown
    let shutdown = rt.block_on(async {
        tokio::select! {
            result = daemon::run(server_config) => result,
            _ = tokio::signal::ctrl_c() => {
                log::info!("Received shutdown signal. Exiting…");
                Ok(())
            }
        }
    });

    if let Err(e) = shutdown {
        log::error!("Server error: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

/// One-shot operator commands against the daemon's database.
fn run_command(server_config: &config::ServerConfig, command: Command) -> Result<()> {
    let now = Utc::now();
    let daemon = Daemon::open(server_config, now)?;

    match command {
        Command::Check => {
            log::info!("Running single check cycle…");
            let report = daemon.run_check_cycle(now)?;
            println!(
                "Checked {} principal(s): {} reminded, {} opened, {} aborted, {} advanced, {} error(s)",
                report.statuses.len(),
                report.reminded.len(),
                report.opened.len(),
                report.aborted.len(),
                report.advanced.len(),
                report.errors.len()
            );
        }
        Command::VerifyAudit => {
            let audit = daemon.audit();
            match audit.verify_integrity() {
                Ok(()) => println!("✅ Audit chain intact ({} entries).", audit.len()),
                Err(e) => {
                    println!("❌ {}", e);
                    match audit.ensure_intact() {
                        Ok(()) => println!("   The break has been acknowledged; appends continue."),
                        Err(unacknowledged) if unacknowledged != e => {
                            println!("   Still unacknowledged: {}", unacknowledged)
                        }
                        Err(_) => {}
                    }
                    std::process::exit(2);
                }
            }
        }
        Command::AcknowledgeBreak { operator } => {
            let sequence = daemon.acknowledge_break(&operator)?;
            println!("Break acknowledged by {} (entry #{}).", operator, sequence);
        }
        Command::Ping { principal } => {
            let status = daemon.ping(&principal, now)?;
            println!(
                "{} checked in: {:?}, succession in {} day(s)",
                status.principal_id,
                status.state,
                status.until_succession.num_days()
            );
        }
        Command::ReportDeath {
            principal,
            verified_by,
        } => print_case(&daemon.report_death(&principal, &verified_by, now)?),
        Command::Confirm {
            case_id,
            epoch,
            channel,
        } => {
            let confirmed = daemon.confirm(&case_id, epoch, channel, now)?;
            println!(
                "{} confirmed until {}",
                confirmed.kind,
                confirmed
                    .expires_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".into())
            );
        }
        Command::SubmitShards {
            case_id,
            epoch,
            files,
        } => {
            let mut shards = Vec::with_capacity(files.len());
            for file in &files {
                let raw = Zeroizing::new(
                    std::fs::read_to_string(file)
                        .with_context(|| format!("Failed to read shard {}", file.display()))?,
                );
                let shard: Shard = serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to parse shard {}", file.display()))?;
                shards.push(shard);
            }
            print_case(&daemon.submit_shards(&case_id, epoch, shards, now)?);
        }
        Command::Advance { case_id, epoch } => print_case(&daemon.advance(&case_id, epoch, now)?),
        Command::Resolve {
            case_id,
            epoch,
            step,
        } => print_case(&daemon.resolve_step(&case_id, epoch, step, now)?),
        Command::Status { case_id } => {
            let status = daemon.case_status(&case_id, now)?;
            print_case(&status.case);
            println!(
                "  Quorum: {}/{} (awaiting {:?})",
                status.quorum.verified, status.quorum.required, status.quorum.awaiting
            );
            println!(
                "  Shards: {}/{}",
                status.shards_collected, status.shards_required
            );
            for step in &status.case.settlement.steps {
                println!("  {:<24} {:?}", step.kind.as_str(), step.status);
            }
            for (step, decision) in &status.liquidation {
                println!("  {:<24} {:?}", step.as_str(), decision);
            }
        }
        Command::SplitSecret {
            principal,
            threshold,
            total,
        } => {
            let mut secret = Zeroizing::new(Vec::new());
            std::io::stdin()
                .read_to_end(&mut secret)
                .context("Failed to read secret from stdin")?;
            while matches!(secret.last(), Some(b'\n' | b'\r')) {
                secret.pop();
            }

            let shamir = ShamirConfig {
                threshold,
                total_shares: total,
            };
            let shards = daemon.split_secret(&principal, shamir, &secret)?;
            eprintln!(
                "Registered {}-of-{} secret for {}. Hand one line to each custodian:",
                threshold, total, principal
            );
            for shard in &shards {
                let line = Zeroizing::new(serde_json::to_string(shard)?);
                println!("{}", line.as_str());
            }
        }
        Command::Run | Command::Validate | Command::Help | Command::Version => {}
    }

    Ok(())
}

fn print_case(case: &SuccessionCase) {
    println!(
        "Case {} ({}): {} at epoch {}",
        case.id,
        case.principal_id,
        case.state.as_str(),
        case.epoch
    );
    if let Some(reason) = &case.abort_reason {
        println!("  Aborted: {}", reason);
    }
}

fn print_help() {
    println!(
        r#"Deadhand Server: succession daemon and operator tools

USAGE:
    deadhand-server [OPTIONS] [COMMAND]

OPTIONS:
    -c, --config <PATH>   Config file path (default: /config/deadhand.toml)
    -h, --help            Show this help message
    -V, --version         Show version

COMMANDS (default: run the daemon):
    --check, --once                          Run a single check cycle and exit
    --validate                               Validate config file and exit
    --verify-audit                           Recompute the audit chain from genesis
    --acknowledge-break <OPERATOR>           Lift an audit halt after review
    --ping <PRINCIPAL>                       Record a check-in
    --report-death <PRINCIPAL> <VERIFIER>    Open a case from an external report
    --confirm <CASE> <EPOCH> <CHANNEL>       Record a channel confirmation
    --submit-shards <CASE> <EPOCH> <FILE>... Submit custodian shards and try verification
    --advance <CASE> <EPOCH>                 Move a case forward
    --resolve <CASE> <EPOCH> <STEP>          Mark a settlement step done out of band
    --status <CASE>                          Show a case
    --split-secret <PRINCIPAL> <T> <N>       Split stdin into N shards, T to recover

ENVIRONMENT VARIABLES (override config file):
    DEADHAND_DATA_DIR              Data directory path
    DEADHAND_CHECK_INTERVAL        Check interval in seconds
    DEADHAND_LOG_LEVEL             Log level (error/warn/info/debug/trace)
    DEADHAND_DEADLOCK_DAYS         Days before a blocked step is force-liquidated
    DEADHAND_COLLABORATOR_TIMEOUT  Collaborator call timeout in seconds

EXAMPLES:
    # Run as daemon with config file
    deadhand-server --config /path/to/config.toml

    # Single check (useful for cron jobs)
    deadhand-server --config config.toml --check

    # Split a principal's recovery secret
    deadhand-server -c config.toml --split-secret alice 3 5 < secret.txt
"#
    );
}
