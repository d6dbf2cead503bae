/// Common types shared by the pipeline engine and its workers
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Frame construction errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame buffer size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("Invalid frame dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
}

/// Raw RGB24 frame, row-major, no padding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    pub width: u32,
    pub height: u32,
    data: Vec<u8>,
}

impl FrameBuffer {
    /// Bytes per pixel for RGB24
    pub const CHANNELS: usize = 3;

    /// Wrap raw RGB24 bytes, checking that the length matches the dimensions
    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::InvalidDimensions { width, height });
        }
        let expected = Self::byte_len(width, height);
        if data.len() != expected {
            return Err(FrameError::SizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Number of bytes a frame of the given size occupies
    #[must_use]
    pub fn byte_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * Self::CHANNELS
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Video metadata attached to every frame item by the frame readers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

/// A single value stored in an [`Item`]
///
/// Annotations are plain JSON. Frames are reference counted so that fanning an
/// item out to several consumers never copies pixel data.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Json(serde_json::Value),
    Frame(Arc<FrameBuffer>),
}

impl Value {
    #[must_use]
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(v) => Some(v),
            Self::Frame(_) => None,
        }
    }

    #[must_use]
    pub fn as_frame(&self) -> Option<&Arc<FrameBuffer>> {
        match self {
            Self::Frame(f) => Some(f),
            Self::Json(_) => None,
        }
    }

    /// Short human-readable description, used for logging
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Frame(f) => format!("Frame {}x{}", f.width, f.height),
            Self::Json(serde_json::Value::Array(items)) => {
                format!("List with {} items", items.len())
            }
            Self::Json(serde_json::Value::Object(map)) => {
                format!("Dict with {} keys", map.len())
            }
            Self::Json(other) => {
                let text = other.to_string();
                if text.len() < 100 {
                    text
                } else {
                    let head: String = text.chars().take(97).collect();
                    format!("{head}...")
                }
            }
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl From<FrameBuffer> for Value {
    fn from(f: FrameBuffer) -> Self {
        Self::Frame(Arc::new(f))
    }
}

impl From<Arc<FrameBuffer>> for Value {
    fn from(f: Arc<FrameBuffer>) -> Self {
        Self::Frame(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Json(serde_json::Value::String(s.to_string()))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Json(serde_json::Value::String(s))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Json(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Self::Json(n.into())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Json(n.into())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Json(b.into())
    }
}

/// One unit of work flowing through the pipeline
///
/// An ordered mapping from key to [`Value`]. Insertion order is kept so that
/// downstream writers see fields in the order upstream stages produced them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Item {
    entries: Vec<(String, Value)>,
}

impl Item {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Insert a value, replacing any previous value under the same key in place
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    /// Builder-style insert
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    #[must_use]
    pub fn get_json(&self, key: &str) -> Option<&serde_json::Value> {
        self.get(key).and_then(Value::as_json)
    }

    #[must_use]
    pub fn get_frame(&self, key: &str) -> Option<&Arc<FrameBuffer>> {
        self.get(key).and_then(Value::as_frame)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Frame number set by the frame readers, if present
    #[must_use]
    pub fn frame_number(&self) -> Option<i64> {
        self.get_json("frame_number").and_then(serde_json::Value::as_i64)
    }

    /// Parsed `video_info` annotation, if present and well formed
    #[must_use]
    pub fn video_info(&self) -> Option<VideoInfo> {
        self.get_json("video_info")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Item {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut item = Item::new();
        for (k, v) in iter {
            item.insert(k, v);
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_item_preserves_insertion_order() {
        let mut item = Item::new();
        item.insert("frame_number", 3i64);
        item.insert("ops", json!([]));
        item.insert("boxes", json!([[0, 0, 10, 10]]));

        let keys: Vec<&str> = item.keys().collect();
        assert_eq!(keys, vec!["frame_number", "ops", "boxes"]);

        // Replacing a value keeps its position
        let previous = item.insert("ops", json!(["detect"]));
        assert_eq!(previous, Some(Value::Json(json!([]))));
        let keys: Vec<&str> = item.keys().collect();
        assert_eq!(keys, vec!["frame_number", "ops", "boxes"]);
    }

    #[test]
    fn test_frame_buffer_size_check() {
        assert!(FrameBuffer::from_rgb(2, 2, vec![0; 12]).is_ok());

        let err = FrameBuffer::from_rgb(2, 2, vec![0; 11]).unwrap_err();
        assert!(matches!(
            err,
            FrameError::SizeMismatch {
                expected: 12,
                actual: 11
            }
        ));

        assert!(FrameBuffer::from_rgb(0, 2, vec![]).is_err());
    }

    #[test]
    fn test_cloned_item_shares_frame() {
        let frame = FrameBuffer::from_rgb(1, 1, vec![1, 2, 3]).unwrap();
        let item = Item::new().with("frame", frame);
        let copy = item.clone();

        let a = item.get_frame("frame").unwrap();
        let b = copy.get_frame("frame").unwrap();
        assert!(Arc::ptr_eq(a, b));
    }

    #[test]
    fn test_video_info_accessor() {
        let item = Item::new().with(
            "video_info",
            json!({"id": "cam1", "fps": 25.0, "width": 640, "height": 480}),
        );
        let info = item.video_info().unwrap();
        assert_eq!(info.id, "cam1");
        assert_eq!(info.width, 640);
        assert!(info.file_name.is_none());
    }
}
