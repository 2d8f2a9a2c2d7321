mod commands;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use logging::LogFormat;

#[derive(Parser)]
#[command(
    name = "medallion",
    version,
    about = "Queue-chained orchestrator for bronze/silver/gold pipelines"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the stage order a run would execute
    Plan {
        /// Path to pipeline YAML file
        config: PathBuf,
        /// Stage to start from, or "all" (default: the config's start_stage)
        #[arg(long)]
        start: Option<String>,
    },
    /// Run the pipeline once and wait for it to finish
    Run {
        /// Path to pipeline YAML file
        config: PathBuf,
        /// Stage to start from, or "all" (default: the config's start_stage)
        #[arg(long)]
        start: Option<String>,
        /// Give up waiting after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Start runs on a fixed interval and process them until interrupted
    Serve {
        /// Path to pipeline YAML file
        config: PathBuf,
        /// Stage to start from, or "all" (default: the config's start_stage)
        #[arg(long)]
        start: Option<String>,
        /// Seconds between runs (default: the config's schedule.interval_secs)
        #[arg(long)]
        interval_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    logging::init(&cli.log_level, cli.log_format);

    match cli.command {
        Commands::Plan { config, start } => {
            commands::plan::execute(&config, start.as_deref())?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            config,
            start,
            timeout_secs,
        } => commands::run::execute(&config, start.as_deref(), timeout_secs).await,
        Commands::Serve {
            config,
            start,
            interval_secs,
        } => {
            commands::serve::execute(&config, start.as_deref(), interval_secs).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
