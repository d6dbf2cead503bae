//! Configuration validation command

use anyhow::{Context as _, Result};
use clap::Args;
use frame_pipeline_core::{
    load_config, resolve_config_path, PipelineController, PipelineGraph, Registry,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Args)]
pub struct ValidateCommand {
    /// Pipeline configuration file (YAML or JSON); defaults to $FRAME_PIPELINE_CONFIG_PATH
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,
}

impl ValidateCommand {
    pub fn execute(self) -> Result<ExitCode> {
        let config_path = resolve_config_path(self.config)?;
        let graph = check_config(&config_path, &frame_pipeline_workers::registry())?;

        println!("Pipeline '{}' is valid", graph.name());
        for worker in graph.workers() {
            let role = if worker.is_source { "source" } else { "worker" };
            let next = if worker.next.is_empty() {
                "-".to_string()
            } else {
                worker.next.join(", ")
            };
            println!(
                "  {} ({}, {}) -> {}",
                worker.name, worker.worker_type, role, next
            );
        }
        Ok(ExitCode::SUCCESS)
    }
}

/// Load a config and initialize every worker against it
fn check_config(path: &Path, registry: &Registry) -> Result<PipelineGraph> {
    let config = load_config(path)
        .with_context(|| format!("Failed to load config {}", path.display()))?;
    let graph = PipelineGraph::new(config.name.clone(), config.workers.clone())
        .context("Invalid pipeline graph")?;

    // Report every unknown type at once rather than the first
    let unknown: Vec<String> = graph
        .workers()
        .iter()
        .filter_map(|worker| {
            registry
                .resolve(&worker.worker_type)
                .err()
                .map(|e| format!("{}: {}", worker.name, e))
        })
        .collect();
    if !unknown.is_empty() {
        anyhow::bail!("Unknown worker types:\n  {}", unknown.join("\n  "));
    }

    PipelineController::validate(&config, registry).context("Invalid worker parameters")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &tempfile::TempDir, stats_type: &str) -> PathBuf {
        let path = dir.path().join("pipeline.yaml");
        let yaml = format!(
            r#"name: stats
workers:
  - name: source
    type: GenericWorker
    source: true
    next: [stats]
  - name: stats
    type: ComputeFrameStats
    stats_type: {stats_type}
    input_key: detections
    output_key: counts
"#
        );
        std::fs::write(&path, yaml).unwrap();
        path
    }

    #[test]
    fn test_valid_config_passes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "count_by_class");
        let graph = check_config(&path, &frame_pipeline_workers::registry()).unwrap();
        assert_eq!(graph.workers().len(), 2);
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn test_bad_worker_params_fail() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "median_area");
        let err = check_config(&path, &frame_pipeline_workers::registry()).unwrap_err();
        assert!(format!("{err:#}").contains("stats"), "{err:#}");
    }

    #[test]
    fn test_unknown_types_are_listed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(
            &path,
            r#"{"workers": [
                {"name": "a", "type": "NoSuchSource", "source": true, "next": ["b"]},
                {"name": "b", "type": "NoSuchSink"}
            ]}"#,
        )
        .unwrap();
        let err = check_config(&path, &frame_pipeline_workers::registry()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("a: ") && message.contains("b: "), "{message}");
    }
}
