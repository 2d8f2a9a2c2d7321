use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use medallion::core::RunStatus;
use medallion::driver::Driver;
use medallion::executor::{Executor, WorkerPool};
use medallion::runs::wait_for_terminal;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Execute the `run` command: start one run, process it, report the result.
pub async fn execute(
    config_path: &Path,
    start: Option<&str>,
    timeout_secs: Option<u64>,
) -> Result<ExitCode> {
    let (config, runtime) = super::load_runtime(config_path)?;
    let start = start.unwrap_or(config.start_stage.as_str());

    let pool = WorkerPool::new(Arc::new(Executor::new(Arc::clone(&runtime))));
    let workers = pool.spawn();

    let run_id = Driver::new(Arc::clone(&runtime))
        .start(start)
        .await
        .with_context(|| format!("Failed to start run from '{start}'"))?;

    let run = wait_for_terminal(
        runtime.runs.as_ref(),
        &run_id,
        POLL_INTERVAL,
        timeout_secs.map(Duration::from_secs),
    )
    .await?;

    pool.shutdown_signal().trigger("run finished");
    for worker in workers {
        if let Err(err) = worker.await {
            tracing::warn!(error = %err, "Worker task ended abnormally");
        }
    }
    runtime.monitor.flush().await;

    println!("Run {} {}", run.run_id, run.status);
    for (stage, status) in run.statuses() {
        println!("  {stage:<24} {status}");
    }
    if let Some(failure) = &run.failure {
        println!("  Failed at '{}': {}", failure.stage, failure.reason);
    }

    match run.status {
        RunStatus::Completed => Ok(ExitCode::SUCCESS),
        RunStatus::Running => {
            println!("  Timed out waiting for the run to finish");
            Ok(ExitCode::from(2))
        }
        RunStatus::Failed => Ok(ExitCode::FAILURE),
    }
}
