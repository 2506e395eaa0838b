//! Command-line parsing for the daemon and its operator commands.

use deadhand_core::ChannelKind;
use deadhand_inherit::StepKind;
use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/config/deadhand.toml";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CliError {
    #[error("{flag} requires {expected}")]
    MissingValue {
        flag: &'static str,
        expected: &'static str,
    },

    #[error("Invalid {what} '{value}' for {flag}")]
    InvalidValue {
        flag: &'static str,
        what: &'static str,
        value: String,
    },

    #[error("Unknown argument: {0}")]
    Unknown(String),

    #[error("Only one command may be given ({first} and {second})")]
    ConflictingCommands {
        first: &'static str,
        second: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the daemon loop
    Run,
    /// Run a single check cycle and exit
    Check,
    Validate,
    VerifyAudit,
    AcknowledgeBreak {
        operator: String,
    },
    Ping {
        principal: String,
    },
    ReportDeath {
        principal: String,
        verified_by: String,
    },
    Confirm {
        case_id: String,
        epoch: u64,
        channel: ChannelKind,
    },
    SubmitShards {
        case_id: String,
        epoch: u64,
        files: Vec<PathBuf>,
    },
    Advance {
        case_id: String,
        epoch: u64,
    },
    Resolve {
        case_id: String,
        epoch: u64,
        step: StepKind,
    },
    Status {
        case_id: String,
    },
    SplitSecret {
        principal: String,
        threshold: u8,
        total: u8,
    },
    Help,
    Version,
}

impl Command {
    fn flag(&self) -> &'static str {
        match self {
            Command::Run => "run",
            Command::Check => "--check",
            Command::Validate => "--validate",
            Command::VerifyAudit => "--verify-audit",
            Command::AcknowledgeBreak { .. } => "--acknowledge-break",
            Command::Ping { .. } => "--ping",
            Command::ReportDeath { .. } => "--report-death",
            Command::Confirm { .. } => "--confirm",
            Command::SubmitShards { .. } => "--submit-shards",
            Command::Advance { .. } => "--advance",
            Command::Resolve { .. } => "--resolve",
            Command::Status { .. } => "--status",
            Command::SplitSecret { .. } => "--split-secret",
            Command::Help => "--help",
            Command::Version => "--version",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cli {
    pub config_path: PathBuf,
    pub command: Command,
}

struct Args<'a> {
    args: &'a [String],
    pos: usize,
}

impl<'a> Args<'a> {
    fn value(&mut self, flag: &'static str, expected: &'static str) -> Result<&'a str, CliError> {
        let value = self
            .args
            .get(self.pos)
            .filter(|v| !v.starts_with('-'))
            .ok_or(CliError::MissingValue { flag, expected })?;
        self.pos += 1;
        Ok(value.as_str())
    }

    fn parsed<T: std::str::FromStr>(
        &mut self,
        flag: &'static str,
        what: &'static str,
    ) -> Result<T, CliError> {
        let raw = self.value(flag, what)?;
        raw.parse().map_err(|_| CliError::InvalidValue {
            flag,
            what,
            value: raw.to_string(),
        })
    }
}

fn parse_step(flag: &'static str, raw: &str) -> Result<StepKind, CliError> {
    StepKind::ORDER
        .iter()
        .copied()
        .find(|s| s.as_str() == raw)
        .ok_or_else(|| CliError::InvalidValue {
            flag,
            what: "step",
            value: raw.to_string(),
        })
}

/// Parse everything after the program name.
pub fn parse_args(argv: &[String]) -> Result<Cli, CliError> {
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    let mut command: Option<Command> = None;
    let mut args = Args { args: argv, pos: 0 };

    while let Some(arg) = argv.get(args.pos) {
        args.pos += 1;
        let next = match arg.as_str() {
            "--config" | "-c" => {
                config_path = PathBuf::from(args.value("--config", "a path argument")?);
                continue;
            }
            "--check" | "--once" => Command::Check,
            "--validate" => Command::Validate,
            "--verify-audit" => Command::VerifyAudit,
            "--acknowledge-break" => Command::AcknowledgeBreak {
                operator: args.value("--acknowledge-break", "an operator name")?.to_string(),
            },
            "--ping" => Command::Ping {
                principal: args.value("--ping", "a principal id")?.to_string(),
            },
            "--report-death" => Command::ReportDeath {
                principal: args.value("--report-death", "a principal id")?.to_string(),
                verified_by: args.value("--report-death", "a verifier name")?.to_string(),
            },
            "--confirm" => {
                let case_id = args.value("--confirm", "a case id")?.to_string();
                let epoch = args.parsed("--confirm", "epoch")?;
                let raw = args.value("--confirm", "a channel")?;
                let channel = raw.parse().map_err(|_| CliError::InvalidValue {
                    flag: "--confirm",
                    what: "channel",
                    value: raw.to_string(),
                })?;
                Command::Confirm {
                    case_id,
                    epoch,
                    channel,
                }
            }
            "--submit-shards" => {
                let case_id = args.value("--submit-shards", "a case id")?.to_string();
                let epoch = args.parsed("--submit-shards", "epoch")?;
                let mut files = vec![PathBuf::from(
                    args.value("--submit-shards", "at least one shard file")?,
                )];
                while let Ok(file) = args.value("--submit-shards", "a shard file") {
                    files.push(PathBuf::from(file));
                }
                Command::SubmitShards {
                    case_id,
                    epoch,
                    files,
                }
            }
            "--advance" => Command::Advance {
                case_id: args.value("--advance", "a case id")?.to_string(),
                epoch: args.parsed("--advance", "epoch")?,
            },
            "--resolve" => {
                let case_id = args.value("--resolve", "a case id")?.to_string();
                let epoch = args.parsed("--resolve", "epoch")?;
                let step = parse_step("--resolve", args.value("--resolve", "a step")?)?;
                Command::Resolve {
                    case_id,
                    epoch,
                    step,
                }
            }
            "--status" => Command::Status {
                case_id: args.value("--status", "a case id")?.to_string(),
            },
            "--split-secret" => Command::SplitSecret {
                principal: args.value("--split-secret", "a principal id")?.to_string(),
                threshold: args.parsed("--split-secret", "threshold")?,
                total: args.parsed("--split-secret", "share count")?,
            },
            "--help" | "-h" => Command::Help,
            "--version" | "-V" => Command::Version,
            other => return Err(CliError::Unknown(other.to_string())),
        };

        if let Some(first) = &command {
            return Err(CliError::ConflictingCommands {
                first: first.flag(),
                second: next.flag(),
            });
        }
        command = Some(next);
    }

    Ok(Cli {
        config_path,
        command: command.unwrap_or(Command::Run),
    })
}
