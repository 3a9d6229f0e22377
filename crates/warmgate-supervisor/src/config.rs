use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::Parser;
use serde::Deserialize;

use crate::{
    error::ConfigError,
    logging::{LogFormat, LoggingConfig},
    process::{CommandSpec, OutputMode, ProcessSpec},
    readiness::{ProbeTarget, ReadinessCheck},
    supervisor::SupervisorConfig,
};

// The inference runtime's default listen address.
const DEFAULT_READINESS_URL: &str = "http://127.0.0.1:11434/";
const DEFAULT_ATTEMPT_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_READINESS_DEADLINE_MS: u64 = 120_000;
const DEFAULT_SETUP_TIMEOUT_MS: u64 = 30 * 60 * 1000;
const DEFAULT_GRACE_MS: u64 = 10_000;
const MIN_POLL_INTERVAL_MS: u64 = 10;

/// Start an inference backend, wait until it answers, then start the app that depends on it.
#[derive(Parser, Debug, Default)]
#[command(name = "warmgate-supervisor")]
#[command(version)]
pub struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "WARMGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Backend command line, run via /bin/sh -c
    #[arg(long, env = "WARMGATE_BACKEND_CMD")]
    pub backend_cmd: Option<String>,

    /// Dependent command line, run via /bin/sh -c
    #[arg(long, env = "WARMGATE_DEPENDENT_CMD")]
    pub dependent_cmd: Option<String>,

    /// Provisioning command run after the backend is ready (repeatable)
    #[arg(long = "setup-cmd", env = "WARMGATE_SETUP_CMDS", value_delimiter = ';')]
    pub setup_cmds: Vec<String>,

    /// Backend readiness endpoint (http://, https:// or tcp://host:port)
    #[arg(long, env = "WARMGATE_READINESS_URL")]
    pub readiness_url: Option<String>,

    /// Accept only this HTTP status (default: any 2xx)
    #[arg(long, env = "WARMGATE_READINESS_EXPECT_STATUS")]
    pub readiness_expect_status: Option<u16>,

    /// Require the response body to contain this text
    #[arg(long, env = "WARMGATE_READINESS_EXPECT_BODY")]
    pub readiness_expect_body: Option<String>,

    #[arg(long, env = "WARMGATE_ATTEMPT_TIMEOUT_MS")]
    pub attempt_timeout_ms: Option<u64>,

    #[arg(long, env = "WARMGATE_POLL_INTERVAL_MS")]
    pub poll_interval_ms: Option<u64>,

    /// Grow the poll interval exponentially up to this value
    #[arg(long, env = "WARMGATE_MAX_POLL_INTERVAL_MS")]
    pub max_poll_interval_ms: Option<u64>,

    #[arg(long, env = "WARMGATE_READINESS_DEADLINE_MS")]
    pub readiness_deadline_ms: Option<u64>,

    #[arg(long, env = "WARMGATE_SETUP_TIMEOUT_MS")]
    pub setup_timeout_ms: Option<u64>,

    /// Time children get to exit after SIGTERM before SIGKILL
    #[arg(long, env = "WARMGATE_GRACE_MS")]
    pub grace_ms: Option<u64>,

    /// Log when the dependent starts accepting traffic at this endpoint
    #[arg(long, env = "WARMGATE_DEPENDENT_READINESS_URL")]
    pub dependent_readiness_url: Option<String>,

    #[arg(long, value_enum, env = "WARMGATE_CHILD_OUTPUT")]
    pub child_output: Option<OutputMode>,

    #[arg(long, value_enum, env = "WARMGATE_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,

    /// Also write logs to daily-rotated files in this directory
    #[arg(long, env = "WARMGATE_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Write a JSON record of the run here on exit
    #[arg(long, env = "WARMGATE_RECORD_PATH")]
    pub record_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessSection {
    pub name: Option<String>,
    pub command: Option<String>,
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl ProcessSection {
    fn command_spec(&self, role: &str) -> Result<CommandSpec, ConfigError> {
        let command = self.command.as_deref().filter(|c| !c.trim().is_empty());
        let program = self.program.as_deref().filter(|p| !p.trim().is_empty());
        match (command, program) {
            (Some(_), Some(_)) => Err(ConfigError::ConflictingCommand {
                role: role.to_string(),
            }),
            (Some(line), None) => Ok(CommandSpec::Shell(line.to_string())),
            (None, Some(program)) => Ok(CommandSpec::Exec {
                program: program.to_string(),
                args: self.args.clone(),
            }),
            (None, None) => Err(ConfigError::MissingCommand {
                role: role.to_string(),
            }),
        }
    }

    fn into_spec(self, role: &str, output: OutputMode) -> Result<ProcessSpec, ConfigError> {
        let command = self.command_spec(role)?;
        let mut spec = ProcessSpec::new(self.name.unwrap_or_else(|| role.to_string()), command);
        spec.env = self.env;
        spec.cwd = self.cwd;
        spec.output = output;
        Ok(spec)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadinessSection {
    pub url: Option<String>,
    pub expect_status: Option<u16>,
    pub expect_body: Option<String>,
    pub attempt_timeout_ms: Option<u64>,
    pub interval_ms: Option<u64>,
    pub max_interval_ms: Option<u64>,
    pub deadline_ms: Option<u64>,
}

impl ReadinessSection {
    fn into_check(self, field: &'static str, url: &str) -> Result<ReadinessCheck, ConfigError> {
        let mut target = ProbeTarget::parse(url)
            .map_err(|reason| ConfigError::InvalidValue { field, reason })?;
        match &mut target {
            ProbeTarget::Http {
                expect_status,
                expect_body,
                ..
            } => {
                *expect_status = self.expect_status;
                *expect_body = self.expect_body.filter(|b| !b.is_empty());
            }
            ProbeTarget::Tcp { .. } => {
                if self.expect_status.is_some() || self.expect_body.is_some() {
                    return Err(ConfigError::InvalidValue {
                        field,
                        reason: "expect_status/expect_body need an http(s) target".to_string(),
                    });
                }
            }
        }

        let interval_ms = positive_ms(
            "readiness.interval_ms",
            self.interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        )?
        .max(MIN_POLL_INTERVAL_MS);
        let max_interval = self
            .max_interval_ms
            .map(|v| Duration::from_millis(v.max(interval_ms)));

        Ok(ReadinessCheck {
            target,
            attempt_timeout: Duration::from_millis(positive_ms(
                "readiness.attempt_timeout_ms",
                self.attempt_timeout_ms.unwrap_or(DEFAULT_ATTEMPT_TIMEOUT_MS),
            )?),
            interval: Duration::from_millis(interval_ms),
            max_interval,
            deadline: Duration::from_millis(positive_ms(
                "readiness.deadline_ms",
                self.deadline_ms.unwrap_or(DEFAULT_READINESS_DEADLINE_MS),
            )?),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvisioningSection {
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShutdownSection {
    pub grace_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    pub format: Option<LogFormat>,
    pub dir: Option<PathBuf>,
}

/// On-disk configuration. Every key is optional; flags and env win.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub child_output: Option<OutputMode>,
    pub record_path: Option<PathBuf>,
    pub backend: Option<ProcessSection>,
    pub dependent: Option<ProcessSection>,
    #[serde(default)]
    pub setup: Vec<ProcessSection>,
    #[serde(default)]
    pub readiness: ReadinessSection,
    pub dependent_readiness: Option<ReadinessSection>,
    #[serde(default)]
    pub provisioning: ProvisioningSection,
    #[serde(default)]
    pub shutdown: ShutdownSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(ConfigError::Parse)
    }
}

fn positive_ms(field: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.trim().is_empty())
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub supervisor: SupervisorConfig,
    pub logging: LoggingConfig,
    pub record_path: Option<PathBuf>,
}

impl Settings {
    pub fn load(cli: Cli) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(cli, file)
    }

    /// Merges flags/env over the file and fills defaults.
    pub fn resolve(cli: Cli, file: FileConfig) -> Result<Self, ConfigError> {
        let output = cli.child_output.or(file.child_output).unwrap_or_default();

        let mut backend = file.backend.unwrap_or_default();
        if let Some(line) = non_empty(cli.backend_cmd) {
            backend.command = Some(line);
            backend.program = None;
        }
        let backend = backend.into_spec("backend", output)?;

        let mut dependent = file.dependent.unwrap_or_default();
        if let Some(line) = non_empty(cli.dependent_cmd) {
            dependent.command = Some(line);
            dependent.program = None;
        }
        let dependent = dependent.into_spec("dependent", output)?;

        let cli_setup: Vec<String> = cli
            .setup_cmds
            .into_iter()
            .filter(|c| !c.trim().is_empty())
            .collect();
        let setup_sections = if cli_setup.is_empty() {
            file.setup
        } else {
            cli_setup
                .into_iter()
                .map(|line| ProcessSection {
                    command: Some(line),
                    ..ProcessSection::default()
                })
                .collect()
        };
        let setup = setup_sections
            .into_iter()
            .enumerate()
            .map(|(i, s)| s.into_spec(&format!("setup-{}", i + 1), output))
            .collect::<Result<Vec<_>, _>>()?;

        let mut readiness = file.readiness;
        readiness.url = non_empty(cli.readiness_url).or(readiness.url);
        readiness.expect_status = cli.readiness_expect_status.or(readiness.expect_status);
        readiness.expect_body = cli.readiness_expect_body.or(readiness.expect_body);
        readiness.attempt_timeout_ms = cli.attempt_timeout_ms.or(readiness.attempt_timeout_ms);
        readiness.interval_ms = cli.poll_interval_ms.or(readiness.interval_ms);
        readiness.max_interval_ms = cli.max_poll_interval_ms.or(readiness.max_interval_ms);
        readiness.deadline_ms = cli.readiness_deadline_ms.or(readiness.deadline_ms);
        let url = readiness
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_READINESS_URL.to_string());
        let readiness = readiness.into_check("readiness.url", &url)?;

        let cli_dep_url = non_empty(cli.dependent_readiness_url);
        let dependent_readiness = match (cli_dep_url, file.dependent_readiness) {
            (None, None) => None,
            (url, section) => {
                let section = section.unwrap_or_default();
                match url.or_else(|| section.url.clone()) {
                    Some(url) => Some(section.into_check("dependent_readiness.url", &url)?),
                    None => {
                        return Err(ConfigError::InvalidValue {
                            field: "dependent_readiness.url",
                            reason: "required when [dependent_readiness] is present".to_string(),
                        });
                    }
                }
            }
        };

        let setup_timeout = Duration::from_millis(positive_ms(
            "provisioning.timeout_ms",
            cli.setup_timeout_ms
                .or(file.provisioning.timeout_ms)
                .unwrap_or(DEFAULT_SETUP_TIMEOUT_MS),
        )?);
        let grace = Duration::from_millis(positive_ms(
            "shutdown.grace_ms",
            cli.grace_ms
                .or(file.shutdown.grace_ms)
                .unwrap_or(DEFAULT_GRACE_MS),
        )?);

        Ok(Settings {
            supervisor: SupervisorConfig {
                backend,
                dependent,
                setup,
                setup_timeout,
                readiness,
                dependent_readiness,
                grace,
            },
            logging: LoggingConfig {
                format: cli.log_format.or(file.logging.format).unwrap_or_default(),
                dir: cli.log_dir.or(file.logging.dir),
            },
            record_path: cli.record_path.or(file.record_path),
        })
    }
}
