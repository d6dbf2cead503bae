//! Frame Pipeline Core - queue-connected worker graph execution
//!
//! This crate turns a declarative stage graph into live workers, one thread
//! per worker, connected by bounded queues. It owns worker lifecycle,
//! supervision and orderly shutdown; the stages themselves plug in through
//! the [`Worker`] trait and the [`Registry`].

pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod worker;

pub use config::{
    load_config, normalize, resolve_config_path, NormalizedConfig, Params, PipelineGraph,
    PipelineOptions, WorkerDescriptor, CONFIG_PATH_ENV, DEFAULT_QUEUE_SIZE,
};
pub use context::{RunSettings, WorkerContext, WorkerState};
pub use controller::{InterruptHandle, PipelineController, RunOutcome};
pub use error::{ConfigError, PipelineError, RegistryError, WorkerError};
pub use queue::{Message, Outputs, QueueFabric};
pub use registry::{Registry, WorkerFactory};
pub use runtime::WorkerOutcome;
pub use worker::{parse_params, Worker};

pub use frame_pipeline_common::{FrameBuffer, Item, Value, VideoInfo};
