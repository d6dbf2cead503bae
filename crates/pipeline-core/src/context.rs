//! Execution context handed to every worker

use crate::config::PipelineGraph;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Settings shared by every worker of one pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    /// Identifier embedded in output file names
    pub run_id: String,

    /// Directory workers write their output into
    pub out_path: PathBuf,
}

impl RunSettings {
    pub fn new(run_id: impl Into<String>, out_path: impl Into<PathBuf>) -> Self {
        Self {
            run_id: run_id.into(),
            out_path: out_path.into(),
        }
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::new("default", "output")
    }
}

/// Context passed to a worker's lifecycle methods
#[derive(Debug, Clone)]
pub struct WorkerContext {
    /// Worker name from the configuration
    pub name: String,

    /// Whether the worker originates items
    pub is_source: bool,

    /// Read-only description of the whole pipeline
    pub graph: Arc<PipelineGraph>,

    /// Monotonic start time shared by all workers of the run
    pub start_time: Instant,

    pub settings: Arc<RunSettings>,
}

impl WorkerContext {
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.settings.run_id
    }

    #[must_use]
    pub fn out_path(&self) -> &Path {
        &self.settings.out_path
    }

    /// Time elapsed since the pipeline was set up
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Lifecycle state of a worker runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkerState {
    Created = 0,
    Initialized = 1,
    Started = 2,
    Running = 3,
    Draining = 4,
    ShutDown = 5,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Initialized,
            2 => Self::Started,
            3 => Self::Running,
            4 => Self::Draining,
            _ => Self::ShutDown,
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Initialized => "initialized",
            Self::Started => "started",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::ShutDown => "shut down",
        };
        f.write_str(name)
    }
}

/// Shared cell holding a [`WorkerState`]
///
/// Written only by the owning runtime, read by the controller.
#[derive(Debug, Clone)]
pub struct StateCell(Arc<AtomicU8>);

impl StateCell {
    #[must_use]
    pub fn new(state: WorkerState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    #[must_use]
    pub fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_cell_shared_between_clones() {
        let cell = StateCell::new(WorkerState::Created);
        let observer = cell.clone();

        cell.set(WorkerState::Draining);
        assert_eq!(observer.get(), WorkerState::Draining);
        assert_eq!(observer.get().to_string(), "draining");
    }

    #[test]
    fn test_default_run_settings() {
        let settings = RunSettings::default();
        assert_eq!(settings.run_id, "default");
        assert_eq!(settings.out_path, PathBuf::from("output"));
    }
}
