//! Error types for the pipeline engine

use thiserror::Error;

/// Problems with the pipeline configuration document or the graph it describes
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unrecognized pipeline configuration shape: {0}")]
    UnrecognizedShape(String),

    #[error("Missing required field '{field}' in {context}")]
    MissingField { field: String, context: String },

    #[error("Invalid value for '{field}' in {context}: {message}")]
    InvalidField {
        field: String,
        context: String,
        message: String,
    },

    #[error("Duplicate worker name: {0}")]
    DuplicateWorker(String),

    #[error("Worker '{worker}' references unknown worker '{target}'")]
    DanglingReference { worker: String, target: String },

    #[error("Worker '{worker}' has more than one upstream producer: {producers:?}")]
    MultipleProducers {
        worker: String,
        producers: Vec<String>,
    },

    #[error("Non-source worker '{0}' has no upstream producer")]
    NoProducer(String),

    #[error("Source worker '{0}' cannot be the target of another worker's 'next'")]
    SourceAsConsumer(String),

    #[error("Worker '{worker}' has unknown type: {source}")]
    UnknownType {
        worker: String,
        #[source]
        source: RegistryError,
    },

    #[error("Invalid pipeline options: {0}")]
    InvalidOptions(String),

    #[error("No pipeline configuration path given; pass --config or set {0}")]
    NoConfigPath(&'static str),

    #[error("Unsupported config file format: {0}")]
    UnsupportedFormat(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Unknown worker type '{0}': not in the built-in table and not a registered qualified path")]
    UnknownWorkerType(String),
}

/// Errors raised by worker implementations
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Missing key in item: {0}")]
    MissingKey(String),

    /// Sources only: the controller asked the source to stop producing
    #[error("Worker halted by pipeline stop")]
    Halted,

    /// The controller gave up waiting and is abandoning the worker
    #[error("Worker terminated by pipeline stop")]
    Terminated,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl WorkerError {
    /// True for the two cancellation variants, which are never reported as failures
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Halted | Self::Terminated)
    }
}

/// Errors surfaced by the pipeline controller
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Worker '{worker}' failed to initialize: {source}")]
    WorkerInit {
        worker: String,
        #[source]
        source: WorkerError,
    },

    #[error("Failed to launch worker '{worker}': {source}")]
    Launch {
        worker: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot create output directory {path}: {source}")]
    OutputDir {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid controller state: {0}")]
    InvalidState(&'static str),
}
