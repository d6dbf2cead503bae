//! Debug worker logging the keys flowing through a pipeline stage

use frame_pipeline_core::{
    parse_params, Item, Outputs, Params, Worker, WorkerContext, WorkerError,
};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, trace, warn};

/// Level used for the periodic item logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum LogLevel {
    Trace,
    Debug,
    Info,
    #[serde(alias = "WARNING")]
    Warn,
    Error,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct LogKeysParams {
    log_level: LogLevel,
    log_values: bool,
    log_sample_interval: usize,
}

impl Default for LogKeysParams {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_values: false,
            log_sample_interval: 20,
        }
    }
}

/// Passes items through unchanged while recording which keys it has seen
///
/// Every `log_sample_interval`-th item is logged with its sorted keys (and
/// value summaries when `log_values` is set). A summary of all keys is logged
/// on shutdown.
#[derive(Debug, Default)]
pub struct LogAllKeys {
    name: String,
    params: LogKeysParams,
    item_count: u64,
    keys_seen: BTreeSet<String>,
    value_samples: BTreeMap<String, String>,
}

impl LogAllKeys {
    fn emit(&self, message: &str) {
        let worker = self.name.as_str();
        match self.params.log_level {
            LogLevel::Trace => trace!(worker, "{}", message),
            LogLevel::Debug => debug!(worker, "{}", message),
            LogLevel::Info => info!(worker, "{}", message),
            LogLevel::Warn => warn!(worker, "{}", message),
            LogLevel::Error => error!(worker, "{}", message),
        }
    }

    /// Keys seen so far, sorted
    pub fn keys_seen(&self) -> impl Iterator<Item = &str> {
        self.keys_seen.iter().map(String::as_str)
    }

    #[must_use]
    pub fn item_count(&self) -> u64 {
        self.item_count
    }
}

impl Worker for LogAllKeys {
    fn initialize(&mut self, ctx: &WorkerContext, params: &Params) -> Result<(), WorkerError> {
        self.name = ctx.name.clone();
        self.params = parse_params(params)?;
        if self.params.log_sample_interval == 0 {
            return Err(WorkerError::InvalidParams(
                "log_sample_interval must be greater than zero".to_string(),
            ));
        }
        info!(
            worker = %self.name,
            "Initialized with log_level: {:?}, log_values: {}, log_sample_interval: {}",
            self.params.log_level,
            self.params.log_values,
            self.params.log_sample_interval
        );
        Ok(())
    }

    fn run(&mut self, item: Option<Item>, out: &Outputs) -> Result<(), WorkerError> {
        let Some(item) = item else {
            warn!(worker = %self.name, "Received no item");
            return Ok(());
        };
        self.item_count += 1;

        for (key, value) in item.iter() {
            self.keys_seen.insert(key.to_string());
            if self.params.log_values && !self.value_samples.contains_key(key) {
                self.value_samples.insert(key.to_string(), value.describe());
            }
        }

        if self.item_count % self.params.log_sample_interval as u64 == 0 {
            let mut keys: Vec<&str> = item.keys().collect();
            keys.sort_unstable();
            self.emit(&format!(
                "Item {} contains {} keys: {}",
                self.item_count,
                item.len(),
                keys.join(", ")
            ));
            if self.params.log_values {
                let mut entries: Vec<_> = item.iter().collect();
                entries.sort_unstable_by_key(|(key, _)| *key);
                for (key, value) in entries {
                    self.emit(&format!("  Key: {} = {}", key, value.describe()));
                }
            }
        }

        out.done_with_item(item)
    }

    fn shutdown(&mut self, _ctx: &WorkerContext) -> Result<(), WorkerError> {
        info!(worker = %self.name, "LogAllKeys worker processed {} items", self.item_count);
        info!(
            worker = %self.name,
            "All keys encountered ({}): {:?}",
            self.keys_seen.len(),
            self.keys_seen
        );
        if self.params.log_values {
            for (key, sample) in &self.value_samples {
                info!(worker = %self.name, "  {} = {}", key, sample);
            }
        }
        Ok(())
    }
}
