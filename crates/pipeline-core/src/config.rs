//! Pipeline configuration: loading, shape normalization and graph validation
//!
//! Two document shapes are accepted and normalized into the same list of
//! [`WorkerDescriptor`]s:
//!
//! ```yaml
//! # Canonical shape: explicit fan-out through `next`
//! name: traffic
//! options:
//!   grace_period_secs: 30
//! workers:
//!   - name: reader
//!     type: ReadFramesFromVidFilesInDir
//!     source: true
//!     next: [stats]
//!     vid_dir: /data/videos
//!   - name: stats
//!     type: ComputeFrameStats
//!     queue_size: 50
//!     params:
//!       stats_type: count_by_class
//! ```
//!
//! ```yaml
//! # Legacy shape: ordered tasks with `prev_task` back-references
//! pipeline:
//!   name: traffic
//!   tasks:
//!     - name: reader
//!       worker_type: ReadFramesFromVidFilesInDir
//!     - name: stats
//!       worker_type: ComputeFrameStats
//!       prev_task: reader
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable holding the default configuration path
pub const CONFIG_PATH_ENV: &str = "FRAME_PIPELINE_CONFIG_PATH";

/// Queue capacity used when neither the worker nor the options set one
pub const DEFAULT_QUEUE_SIZE: usize = 100;

const DEFAULT_PIPELINE_NAME: &str = "default_pipeline";

/// Keys with engine meaning that never reach a worker's params
const META_KEYS: &[&str] = &["prev_task"];

/// Ordered, free-form stage parameters
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Canonical description of one pipeline stage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerDescriptor {
    /// Unique worker name
    pub name: String,

    /// Type name resolved through the worker registry
    pub worker_type: String,

    /// Source workers originate items and have no input queue
    pub is_source: bool,

    /// Stage-specific parameters passed to `initialize`
    pub params: Params,

    /// Names of the workers this one feeds
    pub next: Vec<String>,

    /// Capacity of this worker's input queue
    pub queue_capacity: usize,
}

/// Engine tuning knobs read from the `options` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineOptions {
    /// How long `stop()` waits for workers before forcing them
    pub grace_period_secs: f64,

    /// Supervision poll interval
    pub poll_interval_ms: u64,

    /// Delay before a failing source retries
    pub source_retry_backoff_ms: u64,

    /// Input queue capacity for workers without `queue_size`
    pub default_queue_size: usize,

    /// Abort a worker after this many consecutive item failures (0 = never)
    pub max_consecutive_item_failures: u32,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            grace_period_secs: 30.0,
            poll_interval_ms: 1000,
            source_retry_backoff_ms: 1000,
            default_queue_size: DEFAULT_QUEUE_SIZE,
            max_consecutive_item_failures: 0,
        }
    }
}

impl PipelineOptions {
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs_f64(self.grace_period_secs)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn source_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.source_retry_backoff_ms)
    }

    fn from_value(value: Option<&serde_json::Value>) -> Result<Self, ConfigError> {
        let options = match value {
            None | Some(serde_json::Value::Null) => Self::default(),
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| ConfigError::InvalidOptions(e.to_string()))?,
        };
        options.validate()?;
        Ok(options)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.grace_period_secs.is_finite() || self.grace_period_secs < 0.0 {
            return Err(ConfigError::InvalidOptions(format!(
                "grace_period_secs must be a non-negative number, got {}",
                self.grace_period_secs
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidOptions(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.default_queue_size == 0 {
            return Err(ConfigError::InvalidOptions(
                "default_queue_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of normalizing either configuration shape
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedConfig {
    pub name: String,
    pub workers: Vec<WorkerDescriptor>,
    pub options: PipelineOptions,
}

impl NormalizedConfig {
    /// Set `key` in the params of every worker of the given type
    ///
    /// Returns the number of workers updated.
    pub fn override_param(
        &mut self,
        worker_type: &str,
        key: &str,
        value: serde_json::Value,
    ) -> usize {
        let mut updated = 0;
        for worker in self
            .workers
            .iter_mut()
            .filter(|w| w.worker_type == worker_type)
        {
            worker.params.insert(key.to_string(), value.clone());
            updated += 1;
        }
        updated
    }
}

#[derive(Deserialize)]
struct CanonicalRecord {
    name: String,
    #[serde(rename = "type")]
    worker_type: String,
    #[serde(default)]
    source: bool,
    #[serde(default)]
    next: Vec<String>,
    #[serde(default)]
    queue_size: Option<usize>,
    #[serde(default)]
    params: Params,
    #[serde(flatten)]
    extra: Params,
}

#[derive(Deserialize)]
struct LegacyTask {
    name: String,
    worker_type: String,
    #[serde(default)]
    prev_task: Option<String>,
    #[serde(default)]
    queue_size: Option<usize>,
    #[serde(default)]
    params: Params,
    #[serde(flatten)]
    extra: Params,
}

/// Resolve the configuration path: explicit argument first, then the environment
pub fn resolve_config_path(explicit: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    match std::env::var_os(CONFIG_PATH_ENV) {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => Err(ConfigError::NoConfigPath(CONFIG_PATH_ENV)),
    }
}

/// Read a JSON or YAML document into a generic value, dispatching on extension
pub fn read_raw_config(path: &Path) -> Result<serde_json::Value, ConfigError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let contents = std::fs::read_to_string(path)?;
    match extension.as_str() {
        "json" => Ok(serde_json::from_str(&contents)?),
        "yml" | "yaml" => Ok(serde_yaml::from_str(&contents)?),
        _ => Err(ConfigError::UnsupportedFormat(path.display().to_string())),
    }
}

/// Load and normalize a configuration file
pub fn load_config(path: &Path) -> Result<NormalizedConfig, ConfigError> {
    let raw = read_raw_config(path)?;
    let config = normalize(&raw)?;
    info!(
        "Loaded pipeline configuration '{}' with {} workers from {}",
        config.name,
        config.workers.len(),
        path.display()
    );
    Ok(config)
}

/// Normalize either accepted shape into the canonical worker list
pub fn normalize(raw: &serde_json::Value) -> Result<NormalizedConfig, ConfigError> {
    match raw {
        serde_json::Value::Object(map) => {
            if let Some(pipeline) = map.get("pipeline") {
                let pipeline = pipeline.as_object().ok_or_else(|| {
                    ConfigError::UnrecognizedShape("'pipeline' must be a mapping".to_string())
                })?;
                if pipeline.contains_key("tasks") {
                    return normalize_legacy(pipeline);
                }
                return Err(ConfigError::UnrecognizedShape(
                    "'pipeline' section has no 'tasks' list".to_string(),
                ));
            }
            if let Some(workers) = map.get("workers") {
                let name = optional_name(map)?;
                let options = PipelineOptions::from_value(map.get("options"))?;
                let workers = normalize_canonical(workers, &options)?;
                return Ok(NormalizedConfig {
                    name,
                    workers,
                    options,
                });
            }
            Err(ConfigError::UnrecognizedShape(
                "expected a 'workers' list or a 'pipeline.tasks' list".to_string(),
            ))
        }
        serde_json::Value::Array(_) => {
            let options = PipelineOptions::default();
            let workers = normalize_canonical(raw, &options)?;
            Ok(NormalizedConfig {
                name: DEFAULT_PIPELINE_NAME.to_string(),
                workers,
                options,
            })
        }
        other => Err(ConfigError::UnrecognizedShape(format!(
            "top level must be a mapping or a list, got {}",
            json_kind(other)
        ))),
    }
}

fn normalize_canonical(
    workers: &serde_json::Value,
    options: &PipelineOptions,
) -> Result<Vec<WorkerDescriptor>, ConfigError> {
    let records = as_record_list(workers, "workers")?;
    let mut descriptors = Vec::with_capacity(records.len());

    for (idx, raw) in records.iter().enumerate() {
        let context = format!("workers[{idx}]");
        require_fields(raw, &["name", "type"], &context)?;
        let record: CanonicalRecord =
            serde_json::from_value(raw.clone()).map_err(|e| ConfigError::InvalidField {
                field: "worker".to_string(),
                context: context.clone(),
                message: e.to_string(),
            })?;

        descriptors.push(WorkerDescriptor {
            name: record.name,
            worker_type: record.worker_type,
            is_source: record.source,
            params: merge_params(record.extra, record.params),
            next: record.next,
            queue_capacity: record.queue_size.unwrap_or(options.default_queue_size),
        });
    }

    Ok(descriptors)
}

fn normalize_legacy(pipeline: &Params) -> Result<NormalizedConfig, ConfigError> {
    let name = optional_name(pipeline)?;
    let options = PipelineOptions::from_value(pipeline.get("options"))?;
    let tasks = match pipeline.get("tasks") {
        Some(tasks) => as_record_list(tasks, "pipeline.tasks")?,
        None => return Err(ConfigError::MissingField {
            field: "tasks".to_string(),
            context: "pipeline".to_string(),
        }),
    };

    let mut descriptors = Vec::with_capacity(tasks.len());
    let mut predecessors = Vec::with_capacity(tasks.len());

    for (idx, raw) in tasks.iter().enumerate() {
        let context = format!("pipeline.tasks[{idx}]");
        require_fields(raw, &["name", "worker_type"], &context)?;
        let task: LegacyTask =
            serde_json::from_value(raw.clone()).map_err(|e| ConfigError::InvalidField {
                field: "task".to_string(),
                context: context.clone(),
                message: e.to_string(),
            })?;

        let prev_task = task.prev_task.filter(|p| !p.is_empty());
        descriptors.push(WorkerDescriptor {
            name: task.name,
            worker_type: task.worker_type,
            is_source: prev_task.is_none(),
            params: merge_params(task.extra, task.params),
            next: Vec::new(),
            queue_capacity: task.queue_size.unwrap_or(options.default_queue_size),
        });
        predecessors.push(prev_task);
    }

    // Wire back-references into forward `next` lists. Predecessors are matched
    // by name against the descriptors just built, never by list position.
    for (idx, prev) in predecessors.iter().enumerate() {
        let Some(prev) = prev else { continue };
        let consumer = descriptors[idx].name.clone();
        let producer = descriptors
            .iter_mut()
            .find(|d| d.name == *prev)
            .ok_or_else(|| ConfigError::DanglingReference {
                worker: consumer.clone(),
                target: prev.clone(),
            })?;
        debug!("Wiring legacy task {} -> {}", producer.name, consumer);
        producer.next.push(consumer);
    }

    Ok(NormalizedConfig {
        name,
        workers: descriptors,
        options,
    })
}

fn as_record_list<'a>(
    value: &'a serde_json::Value,
    context: &str,
) -> Result<&'a Vec<serde_json::Value>, ConfigError> {
    let list = value.as_array().ok_or_else(|| ConfigError::InvalidField {
        field: context.to_string(),
        context: "pipeline configuration".to_string(),
        message: format!("expected a list, got {}", json_kind(value)),
    })?;
    if let Some((idx, bad)) = list.iter().enumerate().find(|(_, v)| !v.is_object()) {
        return Err(ConfigError::InvalidField {
            field: format!("{context}[{idx}]"),
            context: "pipeline configuration".to_string(),
            message: format!("expected a mapping, got {}", json_kind(bad)),
        });
    }
    Ok(list)
}

fn require_fields(
    record: &serde_json::Value,
    fields: &[&str],
    context: &str,
) -> Result<(), ConfigError> {
    for field in fields {
        match record.get(*field) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => {}
            _ => {
                return Err(ConfigError::MissingField {
                    field: (*field).to_string(),
                    context: context.to_string(),
                })
            }
        }
    }
    Ok(())
}

fn optional_name(map: &Params) -> Result<String, ConfigError> {
    match map.get("name") {
        None | Some(serde_json::Value::Null) => Ok(DEFAULT_PIPELINE_NAME.to_string()),
        Some(serde_json::Value::String(name)) => Ok(name.clone()),
        Some(other) => Err(ConfigError::InvalidField {
            field: "name".to_string(),
            context: "pipeline".to_string(),
            message: format!("expected a string, got {}", json_kind(other)),
        }),
    }
}

/// Flattened record keys first, explicit `params` entries win on conflict
fn merge_params(mut extra: Params, explicit: Params) -> Params {
    for key in META_KEYS {
        extra.remove(*key);
    }
    for (key, value) in explicit {
        extra.insert(key, value);
    }
    extra
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "a list",
        serde_json::Value::Object(_) => "a mapping",
    }
}

/// Validated, read-only view of the worker graph
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    name: String,
    workers: Vec<WorkerDescriptor>,
    producers: HashMap<String, String>,
}

impl PipelineGraph {
    /// Validate descriptors and build the graph
    ///
    /// Enforces: unique names, every `next` target exists and is not a source,
    /// at most one producer per worker, and exactly one for every non-source.
    pub fn new(name: String, workers: Vec<WorkerDescriptor>) -> Result<Self, ConfigError> {
        let mut names = HashSet::with_capacity(workers.len());
        for worker in &workers {
            if !names.insert(worker.name.as_str()) {
                return Err(ConfigError::DuplicateWorker(worker.name.clone()));
            }
            if worker.queue_capacity == 0 && !worker.is_source {
                return Err(ConfigError::InvalidField {
                    field: "queue_size".to_string(),
                    context: format!("worker '{}'", worker.name),
                    message: "must be greater than zero".to_string(),
                });
            }
        }

        let by_name: HashMap<&str, &WorkerDescriptor> =
            workers.iter().map(|w| (w.name.as_str(), w)).collect();
        let mut producers_of: HashMap<&str, Vec<String>> = HashMap::with_capacity(workers.len());

        for worker in &workers {
            for target in &worker.next {
                let consumer =
                    by_name
                        .get(target.as_str())
                        .ok_or_else(|| ConfigError::DanglingReference {
                            worker: worker.name.clone(),
                            target: target.clone(),
                        })?;
                if consumer.is_source {
                    return Err(ConfigError::SourceAsConsumer(consumer.name.clone()));
                }
                producers_of
                    .entry(consumer.name.as_str())
                    .or_default()
                    .push(worker.name.clone());
            }
        }

        let mut producers = HashMap::with_capacity(producers_of.len());
        for worker in workers.iter().filter(|w| !w.is_source) {
            match producers_of.remove(worker.name.as_str()) {
                None => return Err(ConfigError::NoProducer(worker.name.clone())),
                Some(mut list) if list.len() == 1 => {
                    producers.insert(worker.name.clone(), list.remove(0));
                }
                Some(list) => {
                    return Err(ConfigError::MultipleProducers {
                        worker: worker.name.clone(),
                        producers: list,
                    })
                }
            }
        }

        Ok(Self {
            name,
            workers,
            producers,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Descriptors in configuration order
    #[must_use]
    pub fn workers(&self) -> &[WorkerDescriptor] {
        &self.workers
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&WorkerDescriptor> {
        self.workers.iter().find(|w| w.name == name)
    }

    pub fn sources(&self) -> impl Iterator<Item = &WorkerDescriptor> {
        self.workers.iter().filter(|w| w.is_source)
    }

    /// The single upstream producer of a non-source worker
    #[must_use]
    pub fn producer_of(&self, name: &str) -> Option<&str> {
        self.producers.get(name).map(String::as_str)
    }
}
