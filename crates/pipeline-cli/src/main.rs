//! Frame Pipeline CLI
//!
//! Runs configured worker pipelines over video files.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod commands;

use commands::run::RunCommand;
use commands::validate::ValidateCommand;

#[derive(Parser)]
#[command(
    name = "frame-pipeline",
    version,
    about = "Run multi-stage video processing pipelines",
    long_about = "Run a pipeline of workers connected by bounded queues.\n\
                  The pipeline is described by a YAML or JSON file, either in the\n\
                  canonical `workers` form or the legacy `pipeline.tasks` form.",
    after_help = "EXAMPLES:\n  \
                  # Run a pipeline over every video in a directory\n  \
                  frame-pipeline run --config pipeline.yml --videos-dir ./videos\n\n  \
                  # Use FRAME_PIPELINE_CONFIG_PATH and a custom run id\n  \
                  frame-pipeline run --run-id nightly --output ./results\n\n  \
                  # Check a configuration without starting any worker\n  \
                  frame-pipeline validate --config pipeline.yml\n\n  \
                  # List built-in worker types\n  \
                  frame-pipeline workers"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline until its sources are exhausted or it is interrupted
    Run(RunCommand),

    /// Validate a pipeline configuration without running it
    ///
    /// Checks the graph, resolves every worker type and initializes each
    /// worker with its params. Nothing is started and no output is written.
    Validate(ValidateCommand),

    /// List built-in worker types
    Workers,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Workers => "warn",
        _ if cli.verbose => "debug",
        _ => "info",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    match cli.command {
        Commands::Run(cmd) => cmd.execute().await,
        Commands::Validate(cmd) => cmd.execute(),
        Commands::Workers => {
            commands::workers::list_workers();
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_run_with_overrides() {
        let cli = Cli::try_parse_from([
            "frame-pipeline",
            "run",
            "--config",
            "pipeline.yml",
            "--run-id",
            "r42",
            "--videos-dir",
            "/data/videos",
            "-v",
        ])
        .unwrap();

        assert!(cli.verbose);
        let Commands::Run(cmd) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(cmd.config, Some(PathBuf::from("pipeline.yml")));
        assert_eq!(cmd.run_id, "r42");
        assert_eq!(cmd.videos_dir, Some(PathBuf::from("/data/videos")));
        assert_eq!(cmd.output_dir(), PathBuf::from("output/pipeline_r42"));
    }

    #[test]
    fn test_run_defaults() {
        let cli = Cli::try_parse_from(["frame-pipeline", "run"]).unwrap();
        let Commands::Run(cmd) = cli.command else {
            panic!("expected run command");
        };
        assert!(cmd.config.is_none());
        assert_eq!(cmd.run_id, "default");
        assert_eq!(cmd.output_dir(), PathBuf::from("output/pipeline_default"));
    }

    #[test]
    fn test_unknown_subcommand_rejected() {
        assert!(Cli::try_parse_from(["frame-pipeline", "fast"]).is_err());
    }
}
