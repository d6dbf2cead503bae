//! ffmpeg / ffprobe subprocess helpers for raw RGB24 frame I/O

use frame_pipeline_common::{FrameBuffer, FrameError};
use frame_pipeline_core::WorkerError;
use serde::Deserialize;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Subprocess errors
#[derive(Debug, Error)]
pub enum FfmpegError {
    #[error("Failed to execute {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} failed: {message}")]
    Failed { tool: &'static str, message: String },

    #[error("No video stream in {0}")]
    NoVideoStream(String),

    #[error("Failed to parse ffprobe output: {0}")]
    Parse(String),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FfmpegError> for WorkerError {
    fn from(err: FfmpegError) -> Self {
        match err {
            FfmpegError::Io(e) => WorkerError::Io(e),
            other => WorkerError::Other(other.to_string()),
        }
    }
}

/// Video stream properties reported by ffprobe
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoProbe {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
}

/// Probe the first video stream of a file
pub fn probe_video(path: &Path) -> Result<VideoProbe, FfmpegError> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-select_streams",
            "v:0",
            "-show_streams",
        ])
        .arg(path)
        .output()
        .map_err(|source| FfmpegError::Spawn {
            tool: "ffprobe",
            source,
        })?;

    if !output.status.success() {
        return Err(FfmpegError::Failed {
            tool: "ffprobe",
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    let parsed: ProbeOutput =
        serde_json::from_slice(&output.stdout).map_err(|e| FfmpegError::Parse(e.to_string()))?;
    let stream = parsed
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| FfmpegError::NoVideoStream(path.display().to_string()))?;

    let (Some(width), Some(height)) = (stream.width, stream.height) else {
        return Err(FfmpegError::Parse(format!(
            "missing dimensions for {}",
            path.display()
        )));
    };
    let fps = stream
        .r_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| stream.avg_frame_rate.as_deref().and_then(parse_frame_rate))
        .ok_or_else(|| FfmpegError::Parse(format!("missing frame rate for {}", path.display())))?;

    debug!(
        "Probed {}: {}x{} @ {:.3} fps",
        path.display(),
        width,
        height,
        fps
    );
    Ok(VideoProbe { width, height, fps })
}

/// Parse an ffprobe rate such as `30000/1001` or `25`
#[must_use]
pub fn parse_frame_rate(rate: &str) -> Option<f64> {
    let fps = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.trim().parse().ok()?,
    };
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

/// Streams decoded RGB24 frames from an ffmpeg child process
///
/// The child is killed when the reader is dropped.
pub struct FrameReader {
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
    frames_read: u64,
}

impl FrameReader {
    /// Start decoding `path` at the given frame size
    pub fn spawn(path: &Path, fps: f64, width: u32, height: u32) -> Result<Self, FfmpegError> {
        let mut child = Command::new("ffmpeg")
            .args(["-hide_banner", "-loglevel", "error", "-r"])
            .arg(fps.to_string())
            .arg("-i")
            .arg(path)
            .args([
                "-f",
                "image2pipe",
                "-pix_fmt",
                "rgb24",
                "-vsync",
                "0",
                "-vcodec",
                "rawvideo",
                "-",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| FfmpegError::Spawn {
                tool: "ffmpeg",
                source,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| FfmpegError::Failed {
            tool: "ffmpeg",
            message: "stdout not captured".to_string(),
        })?;

        Ok(Self {
            child,
            stdout,
            width,
            height,
            frames_read: 0,
        })
    }

    /// Next frame, or `None` at end of stream
    ///
    /// A truncated trailing frame is treated as end of stream.
    pub fn next_frame(&mut self) -> Result<Option<FrameBuffer>, FfmpegError> {
        let mut data = vec![0u8; FrameBuffer::byte_len(self.width, self.height)];
        match self.stdout.read_exact(&mut data) {
            Ok(()) => {
                self.frames_read += 1;
                Ok(Some(FrameBuffer::from_rgb(self.width, self.height, data)?))
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[must_use]
    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

/// Encode frames into an H.264 video file
pub fn encode_frames(
    out_path: &Path,
    frames: &[Arc<FrameBuffer>],
    fps: f64,
) -> Result<(), FfmpegError> {
    let Some(first) = frames.first() else {
        return Ok(());
    };
    let size = format!("{}x{}", first.width, first.height);

    let mut child = Command::new("ffmpeg")
        .args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-y",
            "-f",
            "rawvideo",
            "-vcodec",
            "rawvideo",
            "-s",
            &size,
            "-pix_fmt",
            "rgb24",
            "-r",
        ])
        .arg(fps.to_string())
        .args([
            "-i",
            "-",
            "-an",
            "-vcodec",
            "libx264",
            "-vsync",
            "0",
            "-pix_fmt",
            "yuv420p",
        ])
        .arg(out_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| FfmpegError::Spawn {
            tool: "ffmpeg",
            source,
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        for frame in frames {
            if frame.width != first.width || frame.height != first.height {
                warn!(
                    "Skipping {}x{} frame in a {} video",
                    frame.width, frame.height, size
                );
                continue;
            }
            stdin.write_all(frame.data())?;
        }
        // Closing stdin lets ffmpeg finish the file
    }

    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Err(FfmpegError::Failed {
            tool: "ffmpeg",
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate("25"), Some(25.0));
        assert_eq!(parse_frame_rate("30/1"), Some(30.0));
        let ntsc = parse_frame_rate("30000/1001").unwrap();
        assert!((ntsc - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("n/a"), None);
    }

    #[test]
    fn test_encode_nothing_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.mkv");
        encode_frames(&path, &[], 25.0).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_error_maps_to_worker_error() {
        let err: WorkerError = FfmpegError::NoVideoStream("clip.mp4".to_string()).into();
        assert!(err.to_string().contains("clip.mp4"));

        let io: WorkerError =
            FfmpegError::Io(std::io::Error::new(ErrorKind::NotFound, "gone")).into();
        assert!(matches!(io, WorkerError::Io(_)));
    }
}
