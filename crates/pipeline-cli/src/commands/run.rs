//! Pipeline run command

use anyhow::{Context as _, Result};
use clap::Args;
use frame_pipeline_core::{
    load_config, resolve_config_path, PipelineController, RunOutcome, RunSettings,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;
use tracing::{info, warn};

/// Exit status for an interrupted run, as a shell reports SIGINT
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Args)]
pub struct RunCommand {
    /// Pipeline configuration file (YAML or JSON); defaults to $FRAME_PIPELINE_CONFIG_PATH
    #[arg(short, long, value_name = "PATH")]
    pub(crate) config: Option<PathBuf>,

    /// Identifier for this run, used in output file names
    #[arg(long, default_value = "default")]
    pub(crate) run_id: String,

    /// Output directory [default: output/pipeline_<RUN_ID>]
    #[arg(short, long, value_name = "DIR")]
    pub(crate) output: Option<PathBuf>,

    /// Override `vid_dir` for every ReadFramesFromVidFilesInDir worker
    #[arg(long, value_name = "DIR")]
    pub(crate) videos_dir: Option<PathBuf>,
}

impl RunCommand {
    pub(crate) fn output_dir(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(|| {
            PathBuf::from("output").join(format!("pipeline_{}", self.run_id))
        })
    }

    pub async fn execute(self) -> Result<ExitCode> {
        let start = Instant::now();
        let config_path = resolve_config_path(self.config.clone())?;
        let mut config = load_config(&config_path)
            .with_context(|| format!("Failed to load config {}", config_path.display()))?;

        if let Some(dir) = &self.videos_dir {
            let updated = config.override_param(
                "ReadFramesFromVidFilesInDir",
                "vid_dir",
                serde_json::Value::String(dir.display().to_string()),
            );
            if updated == 0 {
                warn!("--videos-dir given but no ReadFramesFromVidFilesInDir worker is configured");
            }
        }

        let output_dir = self.output_dir();
        info!(
            "Starting pipeline '{}' (run id: {}, output: {})",
            config.name,
            self.run_id,
            output_dir.display()
        );

        let settings = RunSettings::new(self.run_id, output_dir);
        let mut controller =
            PipelineController::from_config(config, frame_pipeline_workers::registry(), settings)?;
        let interrupt = controller.interrupt_handle();

        // The controller blocks on worker threads, keep it off the async runtime
        let mut task = tokio::task::spawn_blocking(move || controller.run());
        let outcome = tokio::select! {
            joined = &mut task => joined.context("Pipeline task panicked")?,
            Ok(()) = tokio::signal::ctrl_c() => {
                warn!("Interrupt received, stopping pipeline");
                interrupt.interrupt();
                task.await.context("Pipeline task panicked")?
            }
        };

        info!("Pipeline {} in {:.2?}", outcome, start.elapsed());
        Ok(match outcome {
            RunOutcome::Completed => ExitCode::SUCCESS,
            RunOutcome::Failed => ExitCode::FAILURE,
            RunOutcome::Interrupted => ExitCode::from(EXIT_INTERRUPTED),
        })
    }
}
