use std::{collections::BTreeMap, fmt, path::PathBuf, process::Stdio, time::Duration};

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    task::JoinHandle,
    time::Instant,
};
use warmgate_process::{ExitInfo, ProcessState, ProcessStatus};

use crate::error::SpawnError;

pub const CHILD_LOG_TARGET: &str = "warmgate::child";
/// Longer child output lines are split into several events.
const MAX_LINE_BYTES: usize = 16 * 1024;
/// Consecutive read errors after which a pipe is considered broken.
const MAX_READ_ERRORS: u32 = 16;
/// How long teardown waits for the output readers to reach EOF.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
#[cfg(unix)]
const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSpec {
    /// A command line handed to `/bin/sh -c`.
    Shell(String),
    Exec { program: String, args: Vec<String> },
}

impl CommandSpec {
    fn to_command(&self) -> Command {
        match self {
            CommandSpec::Shell(line) => {
                #[cfg(unix)]
                let mut cmd = {
                    let mut cmd = Command::new("/bin/sh");
                    cmd.arg("-c");
                    cmd
                };
                #[cfg(not(unix))]
                let mut cmd = {
                    let mut cmd = Command::new("cmd");
                    cmd.arg("/C");
                    cmd
                };
                cmd.arg(line);
                cmd
            }
            CommandSpec::Exec { program, args } => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandSpec::Shell(line) => f.write_str(line),
            CommandSpec::Exec { program, args } => {
                f.write_str(program)?;
                for a in args {
                    write!(f, " {a}")?;
                }
                Ok(())
            }
        }
    }
}

/// Where child stdout/stderr go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Re-emit each line as a tracing event.
    #[default]
    Capture,
    Inherit,
}

#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub name: String,
    pub command: CommandSpec,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub output: OutputMode,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, command: CommandSpec) -> Self {
        Self {
            name: name.into(),
            command,
            env: BTreeMap::new(),
            cwd: None,
            output: OutputMode::default(),
        }
    }
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the supervisor dies (crash/kill), ensure the child is terminated.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

/// Reads up to and including the next `\n`, stopping early at `MAX_LINE_BYTES`.
/// Returns the number of bytes appended; 0 means EOF.
async fn read_line_capped<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut read = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(read);
        }
        let newline = available.iter().position(|b| *b == b'\n');
        let end = newline.map_or(available.len(), |i| i + 1);
        let take = end.min(MAX_LINE_BYTES - buf.len());
        buf.extend_from_slice(&available[..take]);
        reader.consume(take);
        read += take;
        if (newline.is_some() && take == end) || buf.len() >= MAX_LINE_BYTES {
            return Ok(read);
        }
    }
}

// The pipe is drained until EOF whatever it carries: closing the read end
// early would kill the child with SIGPIPE on its next write.
fn forward_output<R>(name: String, stream: &'static str, reader: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut errors = 0u32;
        loop {
            buf.clear();
            match read_line_capped(&mut reader, &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    errors = 0;
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']);
                    tracing::info!(target: CHILD_LOG_TARGET, process = %name, stream, "{line}");
                }
                Err(err) => {
                    errors += 1;
                    tracing::debug!(process = %name, stream, error = %err, "reading child output failed");
                    if errors >= MAX_READ_ERRORS {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// One owned child process. Dropping a handle whose child is still running
/// kills the child's whole process group.
#[derive(Debug)]
pub struct ProcessHandle {
    name: String,
    child: Child,
    pid: Option<u32>,
    pgid: Option<i32>,
    state: ProcessState,
    exit: Option<ExitInfo>,
    message: Option<String>,
    started: Instant,
    output: Vec<JoinHandle<()>>,
}

impl ProcessHandle {
    /// Launches the child and returns without waiting for it to become ready.
    pub fn start(spec: &ProcessSpec) -> Result<Self, SpawnError> {
        let mut cmd = spec.command.to_command();
        cmd.envs(&spec.env).stdin(Stdio::null()).kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        match spec.output {
            OutputMode::Capture => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
            OutputMode::Inherit => {
                cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
        }

        // Own session so signals reach the whole tree (`sh -c` and its children).
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                set_parent_death_signal()?;
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|source| SpawnError {
            name: spec.name.clone(),
            command: spec.command.to_string(),
            source,
        })?;
        let pid = child.id();

        let mut output = Vec::new();
        if let Some(out) = child.stdout.take() {
            output.push(forward_output(spec.name.clone(), "stdout", out));
        }
        if let Some(err) = child.stderr.take() {
            output.push(forward_output(spec.name.clone(), "stderr", err));
        }

        tracing::info!(process = %spec.name, pid = ?pid, command = %spec.command, "process started");

        Ok(Self {
            name: spec.name.clone(),
            child,
            pid,
            pgid: pid.map(|p| p as i32),
            state: ProcessState::Starting,
            exit: None,
            message: None,
            started: Instant::now(),
            output,
        })
    }

    #[cfg(test)]
    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn mark_running(&mut self) {
        if self.state == ProcessState::Starting {
            self.state = ProcessState::Running;
        }
    }

    pub fn status(&self) -> ProcessStatus {
        ProcessStatus {
            name: self.name.clone(),
            state: self.state,
            pid: self.pid,
            exit_code: self.exit.and_then(|e| e.code),
            signal: self.exit.and_then(|e| e.signal),
            message: self.message.clone(),
        }
    }

    /// Non-blocking liveness check.
    pub fn is_alive(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.record_exit(status);
                false
            }
            Ok(None) => true,
            Err(err) => {
                self.record_wait_error(err);
                false
            }
        }
    }

    /// Resolves once the child has exited. Cancel safe.
    pub async fn wait_exit(&mut self) -> ExitInfo {
        if let Some(exit) = self.exit {
            return exit;
        }
        match self.child.wait().await {
            Ok(status) => self.record_exit(status),
            Err(err) => self.record_wait_error(err),
        }
    }

    /// SIGTERM to the process group, then SIGKILL once `grace` has elapsed.
    ///
    /// Group members that outlive the leader are stopped too, under the same
    /// deadline, and the output readers are drained before returning.
    pub async fn terminate(&mut self, grace: Duration) -> ExitInfo {
        let deadline = Instant::now() + grace;
        let exit = if self.is_alive() {
            self.stop_leader(grace).await
        } else {
            self.exit.unwrap_or_default()
        };
        self.stop_group(deadline).await;
        self.drain_output().await;
        exit
    }

    async fn stop_leader(&mut self, grace: Duration) -> ExitInfo {
        self.state = ProcessState::Stopping;
        self.message = Some("stopping".to_string());
        tracing::info!(
            process = %self.name,
            grace_ms = grace.as_millis() as u64,
            "stopping process"
        );
        self.signal_terminate();

        if let Ok(exit) = tokio::time::timeout(grace, self.wait_exit()).await {
            return exit;
        }

        tracing::warn!(
            process = %self.name,
            grace_ms = grace.as_millis() as u64,
            "process ignored SIGTERM; killing"
        );
        self.force_kill();
        let exit = self.wait_exit().await;
        self.message = Some("killed after grace period".to_string());
        exit
    }

    fn record_exit(&mut self, status: std::process::ExitStatus) -> ExitInfo {
        let exit = ExitInfo {
            code: status.code(),
            signal: exit_signal(&status),
        };
        let runtime = self.started.elapsed();
        let stopping = self.state == ProcessState::Stopping;

        self.exit = Some(exit);
        if stopping || status.success() {
            self.state = ProcessState::Exited;
        } else {
            self.state = ProcessState::Failed;
        }
        self.message = Some(if stopping {
            "stopped".to_string()
        } else {
            format!("exited with {exit}")
        });

        tracing::info!(
            process = %self.name,
            state = ?self.state,
            exit_code = ?exit.code,
            signal = ?exit.signal,
            runtime_ms = runtime.as_millis() as u64,
            "process exited"
        );
        exit
    }

    fn record_wait_error(&mut self, err: std::io::Error) -> ExitInfo {
        tracing::error!(process = %self.name, error = %err, "wait on process failed");
        let exit = ExitInfo::default();
        self.exit = Some(exit);
        self.state = ProcessState::Failed;
        self.message = Some(format!("wait failed: {err}"));
        exit
    }

    #[cfg(unix)]
    fn signal_group(&mut self, signal: libc::c_int) {
        let Some(pgid) = self.pgid else {
            let _ = self.child.start_kill();
            return;
        };
        let rc = unsafe { libc::kill(-pgid, signal) };
        if rc == -1 {
            tracing::debug!(
                process = %self.name,
                pgid,
                signal,
                error = %std::io::Error::last_os_error(),
                "signal delivery failed"
            );
        }
    }

    #[cfg(unix)]
    fn signal_terminate(&mut self) {
        self.signal_group(libc::SIGTERM);
    }

    #[cfg(unix)]
    fn force_kill(&mut self) {
        self.signal_group(libc::SIGKILL);
    }

    /// Stops whatever is left of the process group once the leader is gone:
    /// background jobs of `sh -c`, worker processes and the like.
    #[cfg(unix)]
    async fn stop_group(&mut self, deadline: Instant) {
        let Some(pgid) = self.pgid else {
            return;
        };
        if group_exists(pgid) {
            tracing::info!(process = %self.name, pgid, "stopping remaining process group members");
            self.signal_group(libc::SIGTERM);
            while group_exists(pgid) {
                if Instant::now() >= deadline {
                    tracing::warn!(process = %self.name, pgid, "process group ignored SIGTERM; killing");
                    self.signal_group(libc::SIGKILL);
                    break;
                }
                tokio::time::sleep(GROUP_POLL_INTERVAL).await;
            }
        }
        // The group is gone; its id may be reused from here on.
        self.pgid = None;
    }

    #[cfg(not(unix))]
    async fn stop_group(&mut self, _deadline: Instant) {}

    #[cfg(unix)]
    fn kill_stragglers(&mut self) {
        if self.pgid.is_some_and(group_exists) {
            tracing::warn!(process = %self.name, "process group outlived its leader; killing");
            self.force_kill();
        }
    }

    #[cfg(not(unix))]
    fn kill_stragglers(&mut self) {}

    async fn drain_output(&mut self) {
        for task in self.output.drain(..) {
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, task).await.is_err() {
                tracing::debug!(process = %self.name, "child output still open after teardown");
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_terminate(&mut self) {
        let _ = self.child.start_kill();
    }

    #[cfg(not(unix))]
    fn force_kill(&mut self) {
        let _ = self.child.start_kill();
    }
}

#[cfg(unix)]
fn group_exists(pgid: i32) -> bool {
    unsafe { libc::kill(-pgid, 0) == 0 }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.is_alive() {
            tracing::warn!(process = %self.name, "process handle dropped while running; killing");
            self.force_kill();
            return;
        }
        self.kill_stragglers();
    }
}
