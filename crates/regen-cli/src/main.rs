//! reGen CLI - operate the GPU worker supervisor.

mod check;
mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "regen")]
#[command(about = "Supervise reGen inference and safety worker processes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a settings file and print the resolved settings
    Check {
        /// Path to the settings file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Run a batch of jobs through the supervisor
    Run {
        /// Path to the settings file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Path to the jobs file (one JSON job per line)
        #[arg(short, long)]
        jobs: PathBuf,

        /// Re-dispatch retryable failures up to this many times
        #[arg(long, default_value = "0")]
        max_retries: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    // Helper to format regen-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(regen_err) = err.downcast_ref::<regen_core::Error>() {
            anyhow::anyhow!("{}", regen_err.with_hint())
        } else {
            err
        }
    };

    match cli.command {
        Commands::Check { config } => check::execute(config.as_deref()).map_err(format_error)?,

        Commands::Run {
            config,
            jobs,
            max_retries,
        } => {
            run::execute(config.as_deref(), &jobs, max_retries)
                .await
                .map_err(format_error)?;
        }
    }

    Ok(())
}
