//! Frame-level statistics over detection lists

use frame_pipeline_core::{
    parse_params, Item, Outputs, Params, Worker, WorkerContext, WorkerError,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

/// Statistic computed per frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsType {
    /// Number of detections per class
    CountByClass,

    /// Mean detection confidence per class
    ConfidenceByClass,
}

#[derive(Debug, Deserialize)]
struct StatsParams {
    stats_type: StatsType,
    input_key: String,
    output_key: String,
}

/// Computes per-class statistics from a detection list
///
/// Detections are objects carrying `class` and `confidence`. The result is an
/// object keyed by class name, in order of first appearance.
#[derive(Debug, Default)]
pub struct ComputeFrameStats {
    name: String,
    params: Option<StatsParams>,
}

impl Worker for ComputeFrameStats {
    fn initialize(&mut self, ctx: &WorkerContext, params: &Params) -> Result<(), WorkerError> {
        self.name = ctx.name.clone();
        let parsed: StatsParams = parse_params(params)?;
        info!(
            worker = %self.name,
            "Initialized with stats type: {:?}, input key: {}, output key: {}",
            parsed.stats_type,
            parsed.input_key,
            parsed.output_key
        );
        self.params = Some(parsed);
        Ok(())
    }

    fn run(&mut self, item: Option<Item>, out: &Outputs) -> Result<(), WorkerError> {
        let mut item = item.ok_or_else(|| WorkerError::Other("expected an item".to_string()))?;
        let params = self
            .params
            .as_ref()
            .ok_or_else(|| WorkerError::Other("worker not initialized".to_string()))?;

        let Some(detections) = item.get_json(&params.input_key) else {
            warn!(worker = %self.name, "Input key '{}' not found in item", params.input_key);
            return out.done_with_item(item);
        };

        let result = match compute(params.stats_type, detections) {
            Ok(result) => result,
            Err(message) => {
                error!(worker = %self.name, "Error computing {:?}: {}", params.stats_type, message);
                Map::new()
            }
        };

        if item.frame_number().is_some_and(|n| n % 100 == 0) {
            debug!(
                worker = %self.name,
                "Processed frame {:?}, stats: {:?}",
                item.frame_number(),
                result
            );
        }

        item.insert(params.output_key.clone(), Value::Object(result));
        out.done_with_item(item)
    }
}

/// Compute one statistic over a JSON list of detections
pub fn compute(stats_type: StatsType, detections: &Value) -> Result<Map<String, Value>, String> {
    let detections = detections
        .as_array()
        .ok_or_else(|| format!("expected a list of detections, got {detections}"))?;

    match stats_type {
        StatsType::CountByClass => {
            let mut counts = Map::new();
            for det in detections {
                let class = class_of(det);
                let count = counts.get(&class).and_then(Value::as_u64).unwrap_or(0);
                counts.insert(class, Value::from(count + 1));
            }
            Ok(counts)
        }
        StatsType::ConfidenceByClass => {
            // class -> (sum, count), insertion ordered
            let mut totals: Vec<(String, f64, u32)> = Vec::new();
            for det in detections {
                let class = class_of(det);
                let confidence = det.get("confidence").and_then(Value::as_f64).unwrap_or(0.0);
                match totals.iter_mut().find(|(c, _, _)| *c == class) {
                    Some((_, sum, count)) => {
                        *sum += confidence;
                        *count += 1;
                    }
                    None => totals.push((class, confidence, 1)),
                }
            }
            Ok(totals
                .into_iter()
                .map(|(class, sum, count)| (class, Value::from(sum / f64::from(count))))
                .collect())
        }
    }
}

fn class_of(detection: &Value) -> String {
    match detection.get("class") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "unknown".to_string(),
    }
}
