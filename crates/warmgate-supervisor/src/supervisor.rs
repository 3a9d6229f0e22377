use std::{future::Future, pin::Pin, time::Duration};

use tokio::{sync::watch, task::JoinHandle};
use warmgate_process::{
    ExitInfo, ProcessRole, ProcessStatus, SupervisionOutcome, SupervisorState,
};

use crate::{
    process::{ProcessHandle, ProcessSpec},
    readiness::{Readiness, ReadinessCheck, ReadinessProber},
};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub backend: ProcessSpec,
    pub dependent: ProcessSpec,
    /// Run in order after the backend is ready and before the dependent starts.
    pub setup: Vec<ProcessSpec>,
    pub setup_timeout: Duration,
    pub readiness: ReadinessCheck,
    /// Informational only: logs when the dependent starts accepting traffic.
    pub dependent_readiness: Option<ReadinessCheck>,
    pub grace: Duration,
}

#[derive(Debug, Clone)]
pub struct SupervisionReport {
    pub outcome: SupervisionOutcome,
    pub transitions: Vec<SupervisorState>,
    pub readiness: Option<Readiness>,
    /// Result of the dependent endpoint probe, if it finished while running.
    pub dependent_readiness: Option<Readiness>,
    pub processes: Vec<ProcessStatus>,
}

impl SupervisionReport {
    pub fn exit_code(&self) -> u8 {
        self.outcome.exit_code()
    }
}

#[derive(Debug, Default)]
struct Children {
    backend: Option<ProcessHandle>,
    dependent: Option<ProcessHandle>,
}

impl Children {
    fn any(&self) -> bool {
        self.backend.is_some() || self.dependent.is_some()
    }
}

async fn stop(handle: Option<&mut ProcessHandle>, grace: Duration) {
    if let Some(h) = handle {
        h.terminate(grace).await;
    }
}

fn exited(role: ProcessRole, exit: ExitInfo) -> SupervisionOutcome {
    tracing::error!(
        role = %role,
        exit_code = ?exit.code,
        signal = ?exit.signal,
        "{role} exited unexpectedly"
    );
    SupervisionOutcome::ProcessExitedUnexpectedly { role, exit }
}

/// Resolves with the time from now until the supervisor reaches `Running`,
/// or `None` when the run ends without getting there.
pub async fn time_to_running(mut state: watch::Receiver<SupervisorState>) -> Option<Duration> {
    let started = tokio::time::Instant::now();
    state
        .wait_for(|s| *s == SupervisorState::Running)
        .await
        .ok()?;
    let elapsed = started.elapsed();
    tracing::info!(startup_ms = elapsed.as_millis() as u64, "dependent is running");
    Some(elapsed)
}

/// Starts the backend, gates the dependent on backend readiness, then watches
/// both until one exits or shutdown is requested.
pub struct Supervisor {
    config: SupervisorConfig,
    prober: ReadinessProber,
    state: watch::Sender<SupervisorState>,
    transitions: Vec<SupervisorState>,
    readiness: Option<Readiness>,
    dependent_readiness: Option<Readiness>,
    setup_statuses: Vec<ProcessStatus>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> anyhow::Result<Self> {
        let (state, _) = watch::channel(SupervisorState::Init);
        Ok(Self {
            config,
            prober: ReadinessProber::new()?,
            state,
            transitions: vec![SupervisorState::Init],
            readiness: None,
            dependent_readiness: None,
            setup_statuses: Vec::new(),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    fn current(&self) -> SupervisorState {
        *self.state.borrow()
    }

    fn transition(&mut self, next: SupervisorState) {
        tracing::info!(from = ?self.current(), to = ?next, "supervisor state");
        self.transitions.push(next);
        self.state.send_replace(next);
    }

    fn cancelled(&self) -> SupervisionOutcome {
        let during = self.current();
        tracing::info!(during = ?during, "shutdown requested before dependent was running");
        SupervisionOutcome::Cancelled { during }
    }

    /// Runs to completion. `shutdown` resolving moves the supervisor to
    /// `Terminating` from whatever state it is in.
    pub async fn run<F>(mut self, shutdown: F) -> SupervisionReport
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut children = Children::default();

        let outcome = self.drive(&mut children, shutdown.as_mut()).await;
        if outcome.is_failure() {
            tracing::error!(outcome = %outcome, exit_code = outcome.exit_code(), "supervision failed");
        } else {
            tracing::info!(outcome = %outcome, "supervision finished");
        }

        if children.any() {
            self.transition(SupervisorState::Terminating);
            let grace = self.config.grace;
            tokio::join!(
                stop(children.dependent.as_mut(), grace),
                stop(children.backend.as_mut(), grace),
            );
        }
        self.transition(SupervisorState::Terminated);

        let mut processes = Vec::new();
        processes.extend(children.backend.as_ref().map(ProcessHandle::status));
        processes.append(&mut self.setup_statuses);
        processes.extend(children.dependent.as_ref().map(ProcessHandle::status));

        SupervisionReport {
            outcome,
            transitions: self.transitions,
            readiness: self.readiness,
            dependent_readiness: self.dependent_readiness,
            processes,
        }
    }

    async fn drive<F>(
        &mut self,
        children: &mut Children,
        mut shutdown: Pin<&mut F>,
    ) -> SupervisionOutcome
    where
        F: Future<Output = ()>,
    {
        self.transition(SupervisorState::BackendStarting);
        let backend = match ProcessHandle::start(&self.config.backend) {
            Ok(h) => children.backend.insert(h),
            Err(err) => {
                tracing::error!(error = %err, "backend failed to start");
                return SupervisionOutcome::BackendFailedToStart {
                    error: err.to_string(),
                };
            }
        };

        self.transition(SupervisorState::AwaitingReadiness);
        let readiness = tokio::select! {
            biased;
            _ = shutdown.as_mut() => return self.cancelled(),
            exit = backend.wait_exit() => return exited(ProcessRole::Backend, exit),
            r = self.prober.wait_until_ready(&self.config.readiness) => r,
        };
        self.readiness = Some(readiness.clone());

        if let Readiness::TimedOut {
            attempts,
            elapsed,
            last_error,
        } = readiness
        {
            let waited_ms = elapsed.as_millis() as u64;
            tracing::error!(
                attempts,
                waited_ms,
                last_error = ?last_error,
                "backend did not become ready before the deadline"
            );
            return SupervisionOutcome::ReadinessTimedOut {
                attempts,
                waited_ms,
            };
        }
        backend.mark_running();

        if !self.config.setup.is_empty() {
            self.transition(SupervisorState::Provisioning);
            let steps = self.config.setup.clone();
            let timeout = self.config.setup_timeout;
            for spec in &steps {
                let mut step = match ProcessHandle::start(spec) {
                    Ok(h) => h,
                    Err(err) => {
                        tracing::error!(step = %spec.name, error = %err, "provisioning step failed to start");
                        return SupervisionOutcome::SetupFailed {
                            step: spec.name.clone(),
                            reason: err.to_string(),
                        };
                    }
                };

                let failed = tokio::select! {
                    biased;
                    _ = shutdown.as_mut() => Some(self.cancelled()),
                    exit = backend.wait_exit() => Some(exited(ProcessRole::Backend, exit)),
                    res = tokio::time::timeout(timeout, step.wait_exit()) => {
                        let reason = match res {
                            Ok(exit) if exit.success() => None,
                            Ok(exit) => Some(format!("exited with {exit}")),
                            Err(_) => Some(format!("timed out after {}ms", timeout.as_millis())),
                        };
                        reason.map(|reason| {
                            tracing::error!(step = %spec.name, reason = %reason, "provisioning step failed");
                            SupervisionOutcome::SetupFailed {
                                step: spec.name.clone(),
                                reason,
                            }
                        })
                    }
                };

                step.terminate(self.config.grace).await;
                self.setup_statuses.push(step.status());
                if let Some(outcome) = failed {
                    return outcome;
                }
                tracing::info!(step = %spec.name, "provisioning step finished");
            }
        }

        self.transition(SupervisorState::DependentStarting);
        let dependent = match ProcessHandle::start(&self.config.dependent) {
            Ok(h) => children.dependent.insert(h),
            Err(err) => {
                tracing::error!(error = %err, "dependent failed to start");
                return SupervisionOutcome::DependentFailedToStart {
                    error: err.to_string(),
                };
            }
        };
        dependent.mark_running();

        self.transition(SupervisorState::Running);
        let probe = self.spawn_dependent_probe();
        let outcome = tokio::select! {
            biased;
            _ = shutdown.as_mut() => {
                tracing::info!("shutdown requested");
                SupervisionOutcome::ReadyAndRunning
            }
            exit = backend.wait_exit() => exited(ProcessRole::Backend, exit),
            exit = dependent.wait_exit() => exited(ProcessRole::Dependent, exit),
        };
        if let Some(task) = probe {
            if task.is_finished() {
                self.dependent_readiness = task.await.ok();
            } else {
                task.abort();
            }
        }
        outcome
    }

    fn spawn_dependent_probe(&self) -> Option<JoinHandle<Readiness>> {
        let check = self.config.dependent_readiness.clone()?;
        let prober = self.prober.clone();
        Some(tokio::spawn(async move {
            let res = prober.wait_until_ready(&check).await;
            if let Readiness::TimedOut { last_error, .. } = &res {
                tracing::warn!(
                    target_endpoint = %check.target,
                    last_error = ?last_error,
                    "dependent did not start accepting traffic before its deadline"
                );
            }
            res
        }))
    }
}
