use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::Instrument;
use warmgate_process::{RunId, exit_codes};

mod config;
mod error;
mod logging;
mod os_signals;
mod process;
mod readiness;
mod record;
mod supervisor;
#[cfg(test)]
mod test_support;

use config::{Cli, Settings};
use error::format_error_chain;
use record::SupervisionRecord;
use supervisor::{Supervisor, time_to_running};

// Parent-death signals are delivered when the spawning thread exits, so every
// child must be spawned from the thread that lives as long as the supervisor.
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let settings = match Settings::load(cli) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("warmgate-supervisor: {err}");
            return ExitCode::from(exit_codes::CONFIG);
        }
    };

    let _log_guard = match logging::init(&settings.logging) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("warmgate-supervisor: {}", format_error_chain(&err));
            return ExitCode::from(exit_codes::INTERNAL);
        }
    };

    let run_id = RunId::new();
    let span = tracing::info_span!("supervise", run_id = %run_id);
    match run(settings, run_id).instrument(span).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            tracing::error!(error = %format_error_chain(&err), "supervisor failed");
            ExitCode::from(exit_codes::INTERNAL)
        }
    }
}

async fn run(settings: Settings, run_id: RunId) -> anyhow::Result<u8> {
    let started_at = record::unix_ms();
    let shutdown = os_signals::shutdown_signal().context("install signal handlers")?;
    let supervisor = Supervisor::new(settings.supervisor).context("build supervisor")?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "warmgate supervisor starting");
    let startup = tokio::spawn(time_to_running(supervisor.subscribe()).in_current_span());
    let report = supervisor.run(shutdown).await;
    let code = report.exit_code();
    let startup_ms = match startup.await {
        Ok(Some(took)) => Some(took.as_millis() as u64),
        _ => None,
    };

    if let Some(path) = settings.record_path {
        let record = SupervisionRecord::new(run_id, started_at, startup_ms, report);
        match record.write(&path).await {
            Ok(()) => tracing::info!(path = %path.display(), "supervision record written"),
            Err(err) => tracing::warn!(
                path = %path.display(),
                error = %format_error_chain(&err),
                "failed to write supervision record"
            ),
        }
    }

    Ok(code)
}
