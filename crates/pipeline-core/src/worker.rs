//! Worker trait and related helpers

use crate::config::Params;
use crate::context::WorkerContext;
use crate::error::WorkerError;
use crate::queue::Outputs;
use frame_pipeline_common::Item;
use serde::de::DeserializeOwned;

/// Core worker trait - every pipeline stage implements this
///
/// The runtime calls `initialize` once during setup (on the controller
/// thread), then `startup`, `run` and `shutdown` on the worker's own thread.
pub trait Worker: Send {
    /// Validate and store stage parameters
    fn initialize(&mut self, ctx: &WorkerContext, params: &Params) -> Result<(), WorkerError>;

    /// Acquire resources (open files, spawn decoders, connect to storage)
    fn startup(&mut self, _ctx: &WorkerContext) -> Result<(), WorkerError> {
        Ok(())
    }

    /// Process one item, or for sources produce items until exhausted
    ///
    /// Sources are called with `None` and return `Ok(())` once they have
    /// nothing more to emit. Items leave the worker only through
    /// [`Outputs::done_with_item`].
    fn run(&mut self, item: Option<Item>, out: &Outputs) -> Result<(), WorkerError>;

    /// Release resources and flush buffered output
    ///
    /// Always called on the way out, even after errors or panics.
    fn shutdown(&mut self, _ctx: &WorkerContext) -> Result<(), WorkerError> {
        Ok(())
    }
}

/// Deserialize typed stage parameters from the free-form params map
///
/// ```
/// use frame_pipeline_core::worker::parse_params;
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// #[serde(default)]
/// struct StatsParams {
///     input_key: String,
/// }
///
/// impl Default for StatsParams {
///     fn default() -> Self {
///         Self { input_key: "detections".to_string() }
///     }
/// }
///
/// let params = serde_json::Map::new();
/// let parsed: StatsParams = parse_params(&params).unwrap();
/// assert_eq!(parsed.input_key, "detections");
/// ```
pub fn parse_params<T: DeserializeOwned>(params: &Params) -> Result<T, WorkerError> {
    serde_json::from_value(serde_json::Value::Object(params.clone()))
        .map_err(|e| WorkerError::InvalidParams(e.to_string()))
}
