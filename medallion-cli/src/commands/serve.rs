use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use medallion::driver::{Driver, Scheduler};
use medallion::executor::{Executor, ShutdownSignal, WorkerPool};

/// Execute the `serve` command: scheduled runs plus workers until ctrl-c.
pub async fn execute(
    config_path: &Path,
    start: Option<&str>,
    interval_secs: Option<u64>,
) -> Result<()> {
    let (config, runtime) = super::load_runtime(config_path)?;
    let Some(interval) = interval_secs.or(config.schedule.interval_secs) else {
        bail!("No schedule: pass --interval-secs or set schedule.interval_secs");
    };
    if interval == 0 {
        bail!("The schedule interval must be at least one second");
    }
    let start = start.unwrap_or(config.start_stage.as_str()).to_string();

    let shutdown = ShutdownSignal::new();
    let pool = WorkerPool::new(Arc::new(Executor::new(Arc::clone(&runtime))))
        .with_shutdown(shutdown.clone());
    let workers = pool.spawn();

    let scheduler = Scheduler::new(
        Driver::new(Arc::clone(&runtime)),
        Duration::from_secs(interval),
        start,
    );
    let scheduled = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { scheduler.run(shutdown).await }
    });

    tracing::info!(
        pipeline = %config.name,
        interval_secs = interval,
        workers = workers.len(),
        "Serving; press ctrl-c to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    shutdown.trigger("interrupted");

    let started = scheduled.await.context("Scheduler task panicked")?;
    for worker in workers {
        if let Err(err) = worker.await {
            tracing::warn!(error = %err, "Worker task ended abnormally");
        }
    }
    runtime.monitor.flush().await;

    let unfinished = runtime
        .runs
        .list()
        .await
        .context("Failed to list runs")?
        .into_iter()
        .filter(|run| !run.is_terminal())
        .count();
    println!(
        "Stopped after starting {} run(s); {unfinished} still running.",
        started.len()
    );
    Ok(())
}
