//! Built-in pipeline workers
//!
//! Every worker here implements [`frame_pipeline_core::Worker`] and is
//! registered under its short type name and its qualified path, e.g.
//! `ComputeFrameStats` and `frame_pipeline_workers::frame_stats::ComputeFrameStats`.
//!
//! # Example
//! ```no_run
//! use frame_pipeline_core::{load_config, PipelineController, RunSettings};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config(Path::new("pipeline.yml"))?;
//! let registry = frame_pipeline_workers::registry();
//! let mut controller =
//!     PipelineController::from_config(config, registry, RunSettings::new("run1", "output"))?;
//! let outcome = controller.run();
//! println!("Pipeline {}", outcome);
//! # Ok(())
//! # }
//! ```

pub mod ffmpeg;
pub mod frame_reader;
pub mod frame_stats;
pub mod frame_writer;
pub mod generic;
pub mod key_writer;
pub mod log_keys;
pub mod motion;

pub use frame_reader::{ReadFramesFromVidFile, ReadFramesFromVidFilesInDir};
pub use frame_stats::ComputeFrameStats;
pub use frame_writer::WriteFramesToVidFiles;
pub use generic::GenericWorker;
pub use key_writer::WriteKeysToFiles;
pub use log_keys::LogAllKeys;
pub use motion::MeanMotionDirection;

use frame_pipeline_core::Registry;

/// Registry pre-populated with every built-in worker
#[must_use]
pub fn registry() -> Registry {
    let mut registry = Registry::new();
    register_builtin_workers(&mut registry);
    registry
}

/// Add every built-in worker to an existing registry
pub fn register_builtin_workers(registry: &mut Registry) {
    registry.register_with_path(
        "GenericWorker",
        "frame_pipeline_workers::generic::GenericWorker",
        || Box::new(GenericWorker::default()),
    );
    registry.register_with_path(
        "ComputeFrameStats",
        "frame_pipeline_workers::frame_stats::ComputeFrameStats",
        || Box::new(ComputeFrameStats::default()),
    );
    registry.register_with_path(
        "MeanMotionDirection",
        "frame_pipeline_workers::motion::MeanMotionDirection",
        || Box::new(MeanMotionDirection::default()),
    );
    registry.register_with_path(
        "WriteKeysToFiles",
        "frame_pipeline_workers::key_writer::WriteKeysToFiles",
        || Box::new(WriteKeysToFiles::default()),
    );
    registry.register_with_path(
        "LogAllKeys",
        "frame_pipeline_workers::log_keys::LogAllKeys",
        || Box::new(LogAllKeys::default()),
    );
    registry.register_with_path(
        "ReadFramesFromVidFile",
        "frame_pipeline_workers::frame_reader::ReadFramesFromVidFile",
        || Box::new(ReadFramesFromVidFile::default()),
    );
    registry.register_with_path(
        "ReadFramesFromVidFilesInDir",
        "frame_pipeline_workers::frame_reader::ReadFramesFromVidFilesInDir",
        || Box::new(ReadFramesFromVidFilesInDir::default()),
    );
    registry.register_with_path(
        "WriteFramesToVidFiles",
        "frame_pipeline_workers::frame_writer::WriteFramesToVidFiles",
        || Box::new(WriteFramesToVidFiles::default()),
    );
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_contains_builtins() {
        let registry = registry();
        let names = registry.type_names();

        assert_eq!(names.len(), 8);
        assert!(names.contains(&"ComputeFrameStats".to_string()));
        assert!(registry.contains("frame_pipeline_workers::motion::MeanMotionDirection"));
        assert!(registry.contains("frame_pipeline_workers.log_keys.LogAllKeys"));
        assert!(!registry.contains("Yolo3Detect"));
    }
}
