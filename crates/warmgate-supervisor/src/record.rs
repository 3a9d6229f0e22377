use std::{
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use warmgate_process::{ProcessStatus, RunId, SupervisionOutcome, SupervisorState};

use crate::{readiness::Readiness, supervisor::SupervisionReport};

/// Machine-readable summary of one supervised run.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisionRecord {
    pub run_id: RunId,
    pub version: &'static str,
    pub started_at_unix_ms: u64,
    pub finished_at_unix_ms: u64,
    pub outcome: SupervisionOutcome,
    pub exit_code: u8,
    pub readiness_attempts: Option<u32>,
    pub readiness_latency_ms: Option<u64>,
    /// Time from launch until the dependent was running.
    pub startup_ms: Option<u64>,
    pub dependent_ready_ms: Option<u64>,
    pub transitions: Vec<SupervisorState>,
    pub processes: Vec<ProcessStatus>,
}

impl SupervisionRecord {
    pub fn new(
        run_id: RunId,
        started_at_unix_ms: u64,
        startup_ms: Option<u64>,
        report: SupervisionReport,
    ) -> Self {
        let exit_code = report.exit_code();
        let (readiness_attempts, readiness_latency_ms) = match report.readiness {
            Some(Readiness::Ready { attempts, elapsed }) => {
                (Some(attempts), Some(elapsed.as_millis() as u64))
            }
            Some(Readiness::TimedOut { attempts, .. }) => (Some(attempts), None),
            None => (None, None),
        };
        let dependent_ready_ms = match report.dependent_readiness {
            Some(Readiness::Ready { elapsed, .. }) => Some(elapsed.as_millis() as u64),
            _ => None,
        };

        Self {
            run_id,
            version: env!("CARGO_PKG_VERSION"),
            started_at_unix_ms,
            finished_at_unix_ms: unix_ms(),
            outcome: report.outcome,
            exit_code,
            readiness_attempts,
            readiness_latency_ms,
            startup_ms,
            dependent_ready_ms,
            transitions: report.transitions,
            processes: report.processes,
        }
    }

    /// Writes the record next to `path` and renames it into place.
    pub async fn write(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }

        let data = serde_json::to_vec_pretty(self).context("serialize supervision record")?;
        let tmp = path.with_extension("json.tmp");
        let mut f = tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("create {}", tmp.display()))?;
        f.write_all(&data).await?;
        f.flush().await?;
        drop(f);

        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("persist {}", path.display()))?;
        Ok(())
    }
}

pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use warmgate_process::{ExitInfo, ProcessRole, ProcessState};

    use super::*;

    fn report() -> SupervisionReport {
        SupervisionReport {
            outcome: SupervisionOutcome::ProcessExitedUnexpectedly {
                role: ProcessRole::Dependent,
                exit: ExitInfo {
                    code: Some(1),
                    signal: None,
                },
            },
            transitions: vec![
                SupervisorState::Init,
                SupervisorState::BackendStarting,
                SupervisorState::AwaitingReadiness,
                SupervisorState::DependentStarting,
                SupervisorState::Running,
                SupervisorState::Terminating,
                SupervisorState::Terminated,
            ],
            readiness: Some(Readiness::Ready {
                attempts: 4,
                elapsed: Duration::from_millis(1_500),
            }),
            dependent_readiness: Some(Readiness::Ready {
                attempts: 2,
                elapsed: Duration::from_millis(800),
            }),
            processes: vec![ProcessStatus {
                name: "dependent".to_string(),
                state: ProcessState::Exited,
                pid: Some(42),
                exit_code: Some(1),
                signal: None,
                message: None,
            }],
        }
    }

    #[test]
    fn record_summarises_report() {
        let rec = SupervisionRecord::new(RunId::new(), 1, Some(2_400), report());
        assert_eq!(rec.exit_code, 21);
        assert_eq!(rec.readiness_attempts, Some(4));
        assert_eq!(rec.readiness_latency_ms, Some(1_500));
        assert_eq!(rec.startup_ms, Some(2_400));
        assert_eq!(rec.dependent_ready_ms, Some(800));
        assert!(rec.finished_at_unix_ms >= rec.started_at_unix_ms);
    }

    #[tokio::test]
    async fn write_replaces_file_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs").join("last.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "stale").unwrap();

        let rec = SupervisionRecord::new(RunId::new(), unix_ms(), None, report());
        rec.write(&path).await.unwrap();

        let raw = std::fs::read(&path).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(v["exit_code"], 21);
        assert_eq!(v["outcome"]["kind"], "process_exited_unexpectedly");
        assert_eq!(v["transitions"][4], "running");
        assert_eq!(v["run_id"], rec.run_id.0.as_str());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn write_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/record.json");
        let rec = SupervisionRecord::new(RunId::new(), unix_ms(), None, report());
        rec.write(&path).await.unwrap();
        assert!(path.exists());
    }
}
