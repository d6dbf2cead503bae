//! Mean motion direction of tracked points inside detection boxes

use frame_pipeline_core::{
    parse_params, Item, Outputs, Params, Worker, WorkerContext, WorkerError,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

/// CSV header describing each row of `points_grouped_by_box`
pub const GROUPED_HEADER: &str =
    "box_idx,num_points,mean_dx,mean_dy,magnitude,angle_radians,angle_degrees";

#[derive(Debug, Deserialize)]
#[serde(default)]
struct MotionParams {
    points_key: String,
    flows_key: String,
    boxes_key: String,
    stationary_threshold: f64,
}

impl Default for MotionParams {
    fn default() -> Self {
        Self {
            points_key: "tracked_points".to_string(),
            flows_key: "tracked_flows".to_string(),
            boxes_key: "boxes".to_string(),
            stationary_threshold: 1.0,
        }
    }
}

/// Motion summary for one box
#[derive(Debug, Clone, PartialEq)]
pub struct BoxMotion {
    pub box_idx: usize,
    pub num_points: usize,
    pub mean_dx: f64,
    pub mean_dy: f64,
    pub magnitude: f64,
    pub angle_radians: f64,
    pub angle_degrees: f64,
}

impl BoxMotion {
    fn to_row(&self) -> Value {
        json!([
            self.box_idx,
            self.num_points,
            self.mean_dx,
            self.mean_dy,
            self.magnitude,
            self.angle_radians,
            self.angle_degrees
        ])
    }
}

/// Groups optical-flow points by the detection box containing them
///
/// Reads points (`[[x, y], ...]`), flows (`[[dx, dy], ...]`, parallel to the
/// points) and boxes (`[x1, y1, x2, y2]` or `{x1, y1, x2, y2}`). Boxes whose
/// mean flow magnitude does not exceed `stationary_threshold` are left out.
#[derive(Debug, Default)]
pub struct MeanMotionDirection {
    name: String,
    params: MotionParams,
}

impl Worker for MeanMotionDirection {
    fn initialize(&mut self, ctx: &WorkerContext, params: &Params) -> Result<(), WorkerError> {
        self.name = ctx.name.clone();
        self.params = parse_params(params)?;
        info!(
            worker = %self.name,
            "Initialized with points_key: {}, flows_key: {}, boxes_key: {}, stationary_threshold: {}",
            self.params.points_key,
            self.params.flows_key,
            self.params.boxes_key,
            self.params.stationary_threshold
        );
        Ok(())
    }

    fn run(&mut self, item: Option<Item>, out: &Outputs) -> Result<(), WorkerError> {
        let mut item = item.ok_or_else(|| WorkerError::Other("expected an item".to_string()))?;
        let p = &self.params;

        let missing: Vec<&str> = [&p.points_key, &p.flows_key, &p.boxes_key]
            .into_iter()
            .filter(|key| !item.contains_key(key))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            warn!(worker = %self.name, "Missing required keys: {}", missing.join(", "));
            return out.done_with_item(item);
        }

        let (Some(points), Some(flows), Some(boxes)) = (
            item.get_json(&p.points_key).and_then(Value::as_array),
            item.get_json(&p.flows_key).and_then(Value::as_array),
            item.get_json(&p.boxes_key).and_then(Value::as_array),
        ) else {
            warn!(worker = %self.name, "Points, flows and boxes must all be lists");
            return out.done_with_item(item);
        };

        let grouped = match group_points_by_box(points, flows, boxes, p.stationary_threshold) {
            Ok(grouped) => grouped,
            Err(message) => {
                error!(worker = %self.name, "Error processing motion data: {}", message);
                Vec::new()
            }
        };

        if item.frame_number().is_some_and(|n| n % 100 == 0) {
            debug!(
                worker = %self.name,
                "Processed frame {:?}, found {} boxes with motion",
                item.frame_number(),
                grouped.len()
            );
        }

        let rows: Vec<Value> = grouped.iter().map(BoxMotion::to_row).collect();
        let box_ids: Vec<usize> = grouped.iter().map(|m| m.box_idx).collect();
        item.insert("points_grouped_by_box", Value::Array(rows));
        item.insert("points_grouped_by_box_header", GROUPED_HEADER);
        item.insert("box_id", json!(box_ids));
        out.done_with_item(item)
    }
}

/// Compute the mean flow of the points inside each box
pub fn group_points_by_box(
    points: &[Value],
    flows: &[Value],
    boxes: &[Value],
    stationary_threshold: f64,
) -> Result<Vec<BoxMotion>, String> {
    if points.len() != flows.len() {
        return Err(format!(
            "{} points but {} flows",
            points.len(),
            flows.len()
        ));
    }
    let points = points
        .iter()
        .map(pair)
        .collect::<Result<Vec<_>, _>>()?;
    let flows = flows.iter().map(pair).collect::<Result<Vec<_>, _>>()?;

    let mut grouped = Vec::new();
    for (box_idx, raw_box) in boxes.iter().enumerate() {
        let Some((x1, y1, x2, y2)) = corners(raw_box) else {
            warn!("Invalid box format: {}", raw_box);
            continue;
        };

        let (mut sum_dx, mut sum_dy, mut num_points) = (0.0f64, 0.0f64, 0usize);
        for ((x, y), (dx, dy)) in points.iter().zip(&flows) {
            if *x >= x1 && *x <= x2 && *y >= y1 && *y <= y2 {
                sum_dx += dx;
                sum_dy += dy;
                num_points += 1;
            }
        }
        if num_points == 0 {
            continue;
        }

        let mean_dx = sum_dx / num_points as f64;
        let mean_dy = sum_dy / num_points as f64;
        let magnitude = mean_dx.hypot(mean_dy);
        if magnitude <= stationary_threshold {
            continue;
        }
        let angle_radians = mean_dy.atan2(mean_dx);
        grouped.push(BoxMotion {
            box_idx,
            num_points,
            mean_dx,
            mean_dy,
            magnitude,
            angle_radians,
            angle_degrees: angle_radians.to_degrees(),
        });
    }
    Ok(grouped)
}

fn pair(value: &Value) -> Result<(f64, f64), String> {
    let coords = value
        .as_array()
        .filter(|c| c.len() >= 2)
        .ok_or_else(|| format!("expected an [x, y] pair, got {value}"))?;
    match (coords[0].as_f64(), coords[1].as_f64()) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(format!("non-numeric coordinates in {value}")),
    }
}

fn corners(raw_box: &Value) -> Option<(f64, f64, f64, f64)> {
    match raw_box {
        Value::Object(map) => {
            let get = |k: &str| map.get(k).and_then(Value::as_f64).unwrap_or(0.0);
            Some((get("x1"), get("y1"), get("x2"), get("y2")))
        }
        Value::Array(coords) if coords.len() >= 4 => Some((
            coords[0].as_f64()?,
            coords[1].as_f64()?,
            coords[2].as_f64()?,
            coords[3].as_f64()?,
        )),
        _ => None,
    }
}
