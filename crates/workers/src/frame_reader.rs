//! Source workers decoding video files into frame items

use crate::ffmpeg::{probe_video, FrameReader, VideoProbe};
use frame_pipeline_core::{
    parse_params, Item, Outputs, Params, VideoInfo, Worker, WorkerContext, WorkerError,
};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

#[derive(Debug, Deserialize)]
struct VidFileParams {
    path: PathBuf,
    height: Option<u32>,
    width: Option<u32>,
    fps: Option<f64>,
    uuid: Option<String>,
}

/// Decode every frame of `path` and emit one item per frame
///
/// Frame numbers start at 1. Returns the number of frames emitted.
fn emit_frames(path: &Path, info: &VideoInfo, out: &Outputs) -> Result<u64, WorkerError> {
    let mut reader = FrameReader::spawn(path, info.fps, info.width, info.height)?;
    let video_info = serde_json::to_value(info)?;
    let mut frame_number = 0i64;

    while let Some(frame) = reader.next_frame()? {
        frame_number += 1;
        let item = Item::with_capacity(4)
            .with("ops", json!([]))
            .with("frame_number", frame_number)
            .with("frame", frame)
            .with("video_info", video_info.clone());
        out.done_with_item(item)?;
    }
    Ok(reader.frames_read())
}

/// Reads a single video file
///
/// Any of `height`, `width` and `fps` left out of the params is probed from
/// the file. The video id defaults to the file stem.
#[derive(Debug, Default)]
pub struct ReadFramesFromVidFile {
    name: String,
    path: PathBuf,
    overrides: (Option<u32>, Option<u32>, Option<f64>),
    uuid: Option<String>,
    frames_emitted: u64,
}

impl ReadFramesFromVidFile {
    fn video_info(&self) -> Result<VideoInfo, WorkerError> {
        let (height, width, fps) = self.overrides;
        let probed = match (height, width, fps) {
            (Some(height), Some(width), Some(fps)) => VideoProbe { width, height, fps },
            _ => {
                let probe = probe_video(&self.path)?;
                VideoProbe {
                    width: width.unwrap_or(probe.width),
                    height: height.unwrap_or(probe.height),
                    fps: fps.unwrap_or(probe.fps),
                }
            }
        };
        let id = self.uuid.clone().unwrap_or_else(|| file_stem(&self.path));
        Ok(VideoInfo {
            id,
            file_name: None,
            file_path: Some(self.path.display().to_string()),
            fps: probed.fps,
            width: probed.width,
            height: probed.height,
        })
    }
}

impl Worker for ReadFramesFromVidFile {
    fn initialize(&mut self, ctx: &WorkerContext, params: &Params) -> Result<(), WorkerError> {
        self.name = ctx.name.clone();
        let parsed: VidFileParams = parse_params(params)?;
        self.path = parsed.path;
        self.overrides = (parsed.height, parsed.width, parsed.fps);
        self.uuid = parsed.uuid;
        info!(worker = %self.name, "Initialized with video path: {}", self.path.display());
        Ok(())
    }

    fn startup(&mut self, _ctx: &WorkerContext) -> Result<(), WorkerError> {
        if !self.path.is_file() {
            return Err(WorkerError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("video file not found: {}", self.path.display()),
            )));
        }
        Ok(())
    }

    fn run(&mut self, _item: Option<Item>, out: &Outputs) -> Result<(), WorkerError> {
        let info = self.video_info()?;
        info!(
            worker = %self.name,
            "Reading {} ({}x{} @ {:.2} fps)",
            self.path.display(),
            info.width,
            info.height,
            info.fps
        );
        self.frames_emitted = emit_frames(&self.path, &info, out)?;
        info!(worker = %self.name, "Finished {} after {} frames", info.id, self.frames_emitted);
        Ok(())
    }

    fn shutdown(&mut self, _ctx: &WorkerContext) -> Result<(), WorkerError> {
        debug!(worker = %self.name, "Emitted {} frames", self.frames_emitted);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct VidDirParams {
    vid_dir: PathBuf,
    #[serde(default = "default_file_regex")]
    file_regex: String,
}

fn default_file_regex() -> String {
    ".*".to_string()
}

/// Reads every matching video in a directory, in file name order
///
/// Files that cannot be probed or decoded are logged and skipped.
#[derive(Debug, Default)]
pub struct ReadFramesFromVidFilesInDir {
    name: String,
    vid_dir: PathBuf,
    file_regex: Option<Regex>,
}

impl Worker for ReadFramesFromVidFilesInDir {
    fn initialize(&mut self, ctx: &WorkerContext, params: &Params) -> Result<(), WorkerError> {
        self.name = ctx.name.clone();
        let parsed: VidDirParams = parse_params(params)?;
        let regex = Regex::new(&parsed.file_regex).map_err(|e| {
            WorkerError::InvalidParams(format!("invalid file_regex '{}': {e}", parsed.file_regex))
        })?;
        self.vid_dir = parsed.vid_dir;
        self.file_regex = Some(regex);
        info!(
            worker = %self.name,
            "Initialized with directory: {}, file regex: {}",
            self.vid_dir.display(),
            parsed.file_regex
        );
        Ok(())
    }

    fn startup(&mut self, _ctx: &WorkerContext) -> Result<(), WorkerError> {
        if !self.vid_dir.is_dir() {
            return Err(WorkerError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("video directory not found: {}", self.vid_dir.display()),
            )));
        }
        Ok(())
    }

    fn run(&mut self, _item: Option<Item>, out: &Outputs) -> Result<(), WorkerError> {
        let regex = self
            .file_regex
            .as_ref()
            .ok_or_else(|| WorkerError::Other("worker not initialized".to_string()))?;
        let files = matching_files(&self.vid_dir, regex)?;
        info!(worker = %self.name, "Found {} matching videos in {}", files.len(), self.vid_dir.display());

        for path in files {
            let probe = match probe_video(&path) {
                Ok(probe) => probe,
                Err(e) => {
                    warn!(worker = %self.name, error = %e, "Skipping {}", path.display());
                    continue;
                }
            };
            let info = VideoInfo {
                id: file_stem(&path),
                file_name: path.file_name().map(|n| n.to_string_lossy().into_owned()),
                file_path: Some(path.display().to_string()),
                fps: probe.fps,
                width: probe.width,
                height: probe.height,
            };

            match emit_frames(&path, &info, out) {
                Ok(frames) => info!(worker = %self.name, "Finished {} after {} frames", info.id, frames),
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => error!(worker = %self.name, error = %e, "Failed reading {}", path.display()),
            }
        }
        Ok(())
    }
}

/// Files in `dir` whose names match `regex`, sorted by name
pub fn matching_files(dir: &Path, regex: &Regex) -> Result<Vec<PathBuf>, WorkerError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if regex.is_match(&entry.file_name().to_string_lossy()) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map_or_else(|| "unknown".to_string(), |s| s.to_string_lossy().into_owned())
}
