use std::fmt;

/// Identifies one supervisor run in logs and in the run record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The two long-running children the supervisor owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessRole {
    Backend,
    Dependent,
}

impl ProcessRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessRole::Backend => "backend",
            ProcessRole::Dependent => "dependent",
        }
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Starting,
    Running,
    Stopping,
    Exited,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProcessStatus {
    pub name: String,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    /// Signal that terminated the process (unix only).
    pub signal: Option<i32>,
    pub message: Option<String>,
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "signal {sig}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Init,
    BackendStarting,
    AwaitingReadiness,
    Provisioning,
    DependentStarting,
    Running,
    Terminating,
    Terminated,
}

/// Stable process exit codes, one per outcome kind.
pub mod exit_codes {
    pub const CLEAN: u8 = 0;
    pub const INTERNAL: u8 = 1;
    pub const CONFIG: u8 = 2;
    pub const BACKEND_FAILED_TO_START: u8 = 10;
    pub const READINESS_TIMED_OUT: u8 = 11;
    pub const SETUP_FAILED: u8 = 12;
    pub const DEPENDENT_FAILED_TO_START: u8 = 13;
    pub const BACKEND_EXITED: u8 = 20;
    pub const DEPENDENT_EXITED: u8 = 21;
}

/// Terminal result of one supervisor run.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SupervisionOutcome {
    /// Both children were running until an external shutdown request.
    ReadyAndRunning,
    /// Shutdown was requested before the dependent was running.
    Cancelled { during: SupervisorState },
    BackendFailedToStart { error: String },
    ReadinessTimedOut { attempts: u32, waited_ms: u64 },
    SetupFailed { step: String, reason: String },
    DependentFailedToStart { error: String },
    ProcessExitedUnexpectedly { role: ProcessRole, exit: ExitInfo },
}

impl SupervisionOutcome {
    pub fn exit_code(&self) -> u8 {
        use exit_codes::*;
        match self {
            SupervisionOutcome::ReadyAndRunning | SupervisionOutcome::Cancelled { .. } => CLEAN,
            SupervisionOutcome::BackendFailedToStart { .. } => BACKEND_FAILED_TO_START,
            SupervisionOutcome::ReadinessTimedOut { .. } => READINESS_TIMED_OUT,
            SupervisionOutcome::SetupFailed { .. } => SETUP_FAILED,
            SupervisionOutcome::DependentFailedToStart { .. } => DEPENDENT_FAILED_TO_START,
            SupervisionOutcome::ProcessExitedUnexpectedly { role, .. } => match role {
                ProcessRole::Backend => BACKEND_EXITED,
                ProcessRole::Dependent => DEPENDENT_EXITED,
            },
        }
    }

    pub fn is_failure(&self) -> bool {
        self.exit_code() != exit_codes::CLEAN
    }
}

impl fmt::Display for SupervisionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisionOutcome::ReadyAndRunning => f.write_str("shut down after running"),
            SupervisionOutcome::Cancelled { during } => {
                write!(f, "shutdown requested during {during:?}")
            }
            SupervisionOutcome::BackendFailedToStart { error } => {
                write!(f, "backend failed to start: {error}")
            }
            SupervisionOutcome::ReadinessTimedOut {
                attempts,
                waited_ms,
            } => write!(
                f,
                "backend not ready after {waited_ms}ms ({attempts} attempts)"
            ),
            SupervisionOutcome::SetupFailed { step, reason } => {
                write!(f, "provisioning step {step} failed: {reason}")
            }
            SupervisionOutcome::DependentFailedToStart { error } => {
                write!(f, "dependent failed to start: {error}")
            }
            SupervisionOutcome::ProcessExitedUnexpectedly { role, exit } => {
                write!(f, "{role} exited unexpectedly ({exit})")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_is_non_empty() {
        let id = RunId::new();
        assert!(!id.0.is_empty());
        assert_ne!(id, RunId::new());
    }

    #[test]
    fn exit_codes_are_distinct_per_failure_kind() {
        let outcomes = [
            SupervisionOutcome::BackendFailedToStart {
                error: "x".to_string(),
            },
            SupervisionOutcome::ReadinessTimedOut {
                attempts: 3,
                waited_ms: 30_000,
            },
            SupervisionOutcome::SetupFailed {
                step: "pull".to_string(),
                reason: "exit code 1".to_string(),
            },
            SupervisionOutcome::DependentFailedToStart {
                error: "x".to_string(),
            },
            SupervisionOutcome::ProcessExitedUnexpectedly {
                role: ProcessRole::Backend,
                exit: ExitInfo::default(),
            },
            SupervisionOutcome::ProcessExitedUnexpectedly {
                role: ProcessRole::Dependent,
                exit: ExitInfo {
                    code: Some(1),
                    signal: None,
                },
            },
        ];
        let mut codes: Vec<u8> = outcomes.iter().map(|o| o.exit_code()).collect();
        assert!(codes.iter().all(|c| *c != exit_codes::CLEAN));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), outcomes.len());
    }

    #[test]
    fn clean_outcomes_exit_zero() {
        assert_eq!(SupervisionOutcome::ReadyAndRunning.exit_code(), 0);
        let cancelled = SupervisionOutcome::Cancelled {
            during: SupervisorState::AwaitingReadiness,
        };
        assert_eq!(cancelled.exit_code(), 0);
        assert!(!cancelled.is_failure());
    }

    #[test]
    fn outcome_serializes_with_kind_tag() {
        let outcome = SupervisionOutcome::ProcessExitedUnexpectedly {
            role: ProcessRole::Dependent,
            exit: ExitInfo {
                code: Some(1),
                signal: None,
            },
        };
        let v = serde_json::to_value(&outcome).unwrap();
        assert_eq!(v["kind"], "process_exited_unexpectedly");
        assert_eq!(v["role"], "dependent");
        assert_eq!(v["exit"]["code"], 1);
        assert_eq!(outcome.to_string(), "dependent exited unexpectedly (exit code 1)");
    }
}
