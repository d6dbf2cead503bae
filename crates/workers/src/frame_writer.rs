//! Writes frames back out as video files

use crate::ffmpeg::encode_frames;
use frame_pipeline_core::{
    parse_params, FrameBuffer, Item, Outputs, Params, Worker, WorkerContext, WorkerError,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

const DEFAULT_FPS: f64 = 30.0;

#[derive(Debug, Deserialize)]
#[serde(default)]
struct FrameWriterParams {
    buffer_size: usize,
    frame_key: String,
}

impl Default for FrameWriterParams {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            frame_key: "frame".to_string(),
        }
    }
}

/// Buffers frames and encodes them into numbered video parts
///
/// Each flush writes `{base}_{frame_key}_model_{run_id}_part_{n}.mkv` into the
/// output directory, where `base` is the source file name up to its first
/// dot. Items are forwarded unchanged.
#[derive(Debug, Default)]
pub struct WriteFramesToVidFiles {
    name: String,
    params: FrameWriterParams,
    out_dir: PathBuf,
    run_id: String,
    frames: Vec<Arc<FrameBuffer>>,
    base_name: Option<String>,
    fps: Option<f64>,
    part: u32,
}

impl Worker for WriteFramesToVidFiles {
    fn initialize(&mut self, ctx: &WorkerContext, params: &Params) -> Result<(), WorkerError> {
        self.name = ctx.name.clone();
        self.params = parse_params(params)?;
        if self.params.buffer_size == 0 {
            return Err(WorkerError::InvalidParams(
                "buffer_size must be greater than zero".to_string(),
            ));
        }
        self.out_dir = ctx.out_path().to_path_buf();
        self.run_id = ctx.run_id().to_string();
        info!(
            worker = %self.name,
            "Initialized with frame key: {}, buffer size: {}",
            self.params.frame_key,
            self.params.buffer_size
        );
        Ok(())
    }

    fn startup(&mut self, _ctx: &WorkerContext) -> Result<(), WorkerError> {
        std::fs::create_dir_all(&self.out_dir)?;
        Ok(())
    }

    fn run(&mut self, item: Option<Item>, out: &Outputs) -> Result<(), WorkerError> {
        let item = item.ok_or_else(|| WorkerError::Other("expected an item".to_string()))?;

        match item.get_frame(&self.params.frame_key) {
            Some(frame) => {
                if self.base_name.is_none() {
                    let info = item.video_info();
                    self.base_name = Some(base_name(
                        info.as_ref().and_then(|i| i.file_name.as_deref()),
                    ));
                    self.fps = info.map(|i| i.fps).filter(|fps| *fps > 0.0);
                }
                self.frames.push(Arc::clone(frame));
                if self.frames.len() >= self.params.buffer_size {
                    if let Err(e) = self.flush() {
                        error!(worker = %self.name, error = %e, "Error writing video part");
                    }
                }
            }
            None => warn!(
                worker = %self.name,
                "Frame key '{}' not found in item",
                self.params.frame_key
            ),
        }

        out.done_with_item(item)
    }

    fn shutdown(&mut self, _ctx: &WorkerContext) -> Result<(), WorkerError> {
        let result = self.flush();
        info!(worker = %self.name, "Wrote {} video parts", self.part);
        result
    }
}

impl WriteFramesToVidFiles {
    fn flush(&mut self) -> Result<(), WorkerError> {
        if self.frames.is_empty() {
            return Ok(());
        }
        self.part += 1;
        let path = part_path(
            &self.out_dir,
            self.base_name.as_deref().unwrap_or("output"),
            &self.params.frame_key,
            &self.run_id,
            self.part,
        );
        let frames = std::mem::take(&mut self.frames);
        encode_frames(&path, &frames, self.fps.unwrap_or(DEFAULT_FPS))?;
        info!(worker = %self.name, "Wrote {} frames to {}", frames.len(), path.display());
        Ok(())
    }
}

/// File name up to the first dot, or `output` when unknown
fn base_name(file_name: Option<&str>) -> String {
    file_name
        .and_then(|name| name.split('.').next())
        .filter(|base| !base.is_empty())
        .unwrap_or("output")
        .to_string()
}

fn part_path(out_dir: &Path, base: &str, frame_key: &str, run_id: &str, part: u32) -> PathBuf {
    out_dir.join(format!("{base}_{frame_key}_model_{run_id}_part_{part}.mkv"))
}
